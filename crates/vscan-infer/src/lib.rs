#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod ops;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferError {
    #[error("input tensor is {got:?}, engine expects {want:?}")]
    ShapeMismatch { got: Vec<usize>, want: Vec<usize> },
    #[error("batch dimension must be > 0")]
    EmptyBatch,
    #[error("model load failed: {0}")]
    Load(String),
    #[error("forward pass failed: {0}")]
    Forward(String),
}

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod v0 {
    tonic::include_proto!("vscan.v0");
}

pub mod convert;

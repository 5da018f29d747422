//! Network seam for the evaluator.
//!
//! Engines are variant types selected once at evaluator startup. The
//! reference engine validates shapes and discards outputs, which is all the
//! compute-bound pipeline needs; the ONNX engine (feature `onnx`) runs a
//! real model through ONNX Runtime.

use ndarray::{Array3, Array4};
use tracing::info;

use vscan_core::types::GpuId;

use crate::InferError;

/// Input edge of the reference network.
pub const REFERENCE_INPUT_SIZE: usize = 227;
/// Native edge of the reference mean image; resized per evaluator.
pub const REFERENCE_MEAN_SIZE: usize = 256;
/// Classic per-channel BGR dataset means.
pub const REFERENCE_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];

/// Which network each evaluator loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSpec {
    Reference,
    #[cfg(feature = "onnx")]
    Onnx { path: std::path::PathBuf },
}

impl ModelSpec {
    /// Parse the `--model` option: `reference`, or a path to an ONNX model
    /// when the `onnx` feature is enabled.
    pub fn parse(raw: &str) -> Result<Self, InferError> {
        if raw.eq_ignore_ascii_case("reference") {
            return Ok(ModelSpec::Reference);
        }
        Self::parse_model_path(raw)
    }

    #[cfg(feature = "onnx")]
    fn parse_model_path(raw: &str) -> Result<Self, InferError> {
        Ok(ModelSpec::Onnx {
            path: std::path::PathBuf::from(raw),
        })
    }

    #[cfg(not(feature = "onnx"))]
    fn parse_model_path(raw: &str) -> Result<Self, InferError> {
        Err(InferError::Load(format!(
            "unknown model {raw:?} (rebuild with --features onnx to load model files)"
        )))
    }
}

/// A loaded network plus the inputs the evaluator must prepare for it.
pub struct NetInfo {
    pub engine: Engine,
    /// Square edge of the network input in pixels.
    pub input_size: usize,
    /// Mean image at its native size, HWC float BGR.
    pub mean_image: Array3<f32>,
}

pub enum Engine {
    Reference(ReferenceEngine),
    #[cfg(feature = "onnx")]
    Onnx(OnnxEngine),
}

impl Engine {
    pub fn batch(&self) -> usize {
        match self {
            Engine::Reference(e) => e.batch,
            #[cfg(feature = "onnx")]
            Engine::Onnx(e) => e.batch,
        }
    }

    /// Change the batch dimension the next `forward` expects.
    pub fn reshape_batch(&mut self, n: usize) -> Result<(), InferError> {
        if n == 0 {
            return Err(InferError::EmptyBatch);
        }
        match self {
            Engine::Reference(e) => e.batch = n,
            #[cfg(feature = "onnx")]
            Engine::Onnx(e) => e.batch = n,
        }
        Ok(())
    }

    /// Run one forward pass. Blocking; returns once the pass has consumed
    /// the input tensor.
    pub fn forward(&mut self, input: &Array4<f32>) -> Result<(), InferError> {
        match self {
            Engine::Reference(e) => e.forward(input),
            #[cfg(feature = "onnx")]
            Engine::Onnx(e) => e.forward(input),
        }
    }
}

/// Load the network for one evaluator, pinned to `device`.
pub fn load_network(spec: &ModelSpec, device: GpuId, batch: usize) -> Result<NetInfo, InferError> {
    if batch == 0 {
        return Err(InferError::EmptyBatch);
    }
    match spec {
        ModelSpec::Reference => {
            info!(gpu = %device, model = "reference", "loaded network");
            let mean_image = Array3::from_shape_fn(
                (REFERENCE_MEAN_SIZE, REFERENCE_MEAN_SIZE, 3),
                |(_, _, c)| REFERENCE_MEAN_BGR[c],
            );
            Ok(NetInfo {
                engine: Engine::Reference(ReferenceEngine::new(batch)),
                input_size: REFERENCE_INPUT_SIZE,
                mean_image,
            })
        }
        #[cfg(feature = "onnx")]
        ModelSpec::Onnx { path } => {
            let engine = OnnxEngine::load(path, batch)?;
            let input_size = engine.input_size;
            info!(gpu = %device, model = %path.display(), input_size = input_size as u64, "loaded network");
            Ok(NetInfo {
                mean_image: Array3::zeros((input_size, input_size, 3)),
                input_size,
                engine: Engine::Onnx(engine),
            })
        }
    }
}

/// Shape-checking stand-in for a convolutional network.
///
/// Reduces the input so the pass cannot be elided, then discards the result,
/// matching the pipeline's no-output contract.
pub struct ReferenceEngine {
    batch: usize,
    forward_calls: u64,
    frames_seen: u64,
}

impl ReferenceEngine {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            forward_calls: 0,
            frames_seen: 0,
        }
    }

    pub fn forward_calls(&self) -> u64 {
        self.forward_calls
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<(), InferError> {
        let got = input.shape().to_vec();
        let want = vec![
            self.batch,
            3,
            REFERENCE_INPUT_SIZE,
            REFERENCE_INPUT_SIZE,
        ];
        if got != want {
            return Err(InferError::ShapeMismatch { got, want });
        }
        let reduction: f32 = input.iter().sum();
        std::hint::black_box(reduction);
        self.forward_calls += 1;
        self.frames_seen += self.batch as u64;
        Ok(())
    }
}

#[cfg(feature = "onnx")]
pub struct OnnxEngine {
    session: ort::session::Session,
    batch: usize,
    input_size: usize,
}

#[cfg(feature = "onnx")]
impl OnnxEngine {
    fn load(path: &std::path::Path, batch: usize) -> Result<Self, InferError> {
        let session = ort::session::Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| InferError::Load(e.to_string()))?;

        // Static spatial dims when the model declares them, 224 otherwise.
        let input_size = session
            .inputs
            .first()
            .and_then(|input| match &input.input_type {
                ort::value::ValueType::Tensor { dimensions, .. } => {
                    dimensions.get(2).copied().filter(|d| *d > 0)
                }
                _ => None,
            })
            .map(|d| d as usize)
            .unwrap_or(224);

        Ok(Self {
            session,
            batch,
            input_size,
        })
    }

    fn forward(&mut self, input: &Array4<f32>) -> Result<(), InferError> {
        let got = input.shape().to_vec();
        let want = vec![self.batch, 3, self.input_size, self.input_size];
        if got != want {
            return Err(InferError::ShapeMismatch { got, want });
        }
        let tensor = ort::value::Tensor::from_array(input.clone())
            .map_err(|e| InferError::Forward(e.to_string()))?;
        self.session
            .run(ort::inputs![tensor])
            .map_err(|e| InferError::Forward(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn reference_counts_frames_per_forward() {
        let info = load_network(&ModelSpec::Reference, GpuId(0), 4).unwrap();
        let mut engine = info.engine;
        let input = Array4::zeros((4, 3, REFERENCE_INPUT_SIZE, REFERENCE_INPUT_SIZE));
        engine.forward(&input).unwrap();
        engine.forward(&input).unwrap();
        match &engine {
            Engine::Reference(e) => {
                assert_eq!(e.forward_calls(), 2);
                assert_eq!(e.frames_seen(), 8);
            }
            #[cfg(feature = "onnx")]
            _ => unreachable!(),
        }
    }

    #[test]
    fn reshape_changes_expected_batch() {
        let info = load_network(&ModelSpec::Reference, GpuId(0), 4).unwrap();
        let mut engine = info.engine;
        engine.reshape_batch(3).unwrap();
        let input = Array4::zeros((4, 3, REFERENCE_INPUT_SIZE, REFERENCE_INPUT_SIZE));
        assert!(matches!(
            engine.forward(&input),
            Err(InferError::ShapeMismatch { .. })
        ));
        let input = Array4::zeros((3, 3, REFERENCE_INPUT_SIZE, REFERENCE_INPUT_SIZE));
        engine.forward(&input).unwrap();
    }

    #[test]
    fn zero_batch_rejected() {
        assert!(matches!(
            load_network(&ModelSpec::Reference, GpuId(0), 0),
            Err(InferError::EmptyBatch)
        ));
        let info = load_network(&ModelSpec::Reference, GpuId(0), 1).unwrap();
        let mut engine = info.engine;
        assert!(matches!(
            engine.reshape_batch(0),
            Err(InferError::EmptyBatch)
        ));
    }

    #[test]
    fn mean_image_carries_channel_means() {
        let info = load_network(&ModelSpec::Reference, GpuId(0), 1).unwrap();
        assert_eq!(info.mean_image.dim(), (256, 256, 3));
        assert_eq!(info.mean_image[(10, 20, 0)], 104.0);
        assert_eq!(info.mean_image[(10, 20, 2)], 123.0);
    }
}

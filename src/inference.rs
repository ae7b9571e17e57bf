// src/inference.rs

use crate::types::{BackendKind, ModelConfig};
use anyhow::Result;
use ndarray::{Array4, ArrayD, IxDyn};
use tracing::{debug, info};

/// Anything that turns a preprocessed `(1, size, size, 3)` batch into the
/// detector's raw output tensors.
pub trait InferenceBackend {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>>;
}

/// Stand-in detector for lane-only runs. Produces empty outputs shaped the
/// way the configured head layout expects, so decoding yields no boxes.
pub struct NullBackend {
    fused: bool,
}

impl NullBackend {
    pub fn new(fused: bool) -> Self {
        Self { fused }
    }
}

impl InferenceBackend for NullBackend {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let batch = input.shape()[0];
        debug!("Null backend: returning empty predictions for batch of {}", batch);
        if self.fused {
            Ok(vec![ArrayD::zeros(IxDyn(&[batch, 0, 5]))])
        } else {
            Ok(vec![
                ArrayD::zeros(IxDyn(&[batch, 0, 4])),
                ArrayD::zeros(IxDyn(&[batch, 0, 1])),
            ])
        }
    }
}

/// Build the backend selected in the model configuration.
pub fn build_backend(config: &ModelConfig) -> Result<Box<dyn InferenceBackend + Send>> {
    match config.backend {
        BackendKind::None => {
            info!("Inference disabled; running lane extraction only");
            Ok(Box::new(NullBackend::new(config.fused_output)))
        }
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => Ok(Box::new(OnnxBackend::new(config)?)),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => Err(crate::error::ConfigError::Invalid {
            field: "model.backend",
            reason: "the onnx backend needs the `onnx` feature".to_string(),
        }
        .into()),
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

#[cfg(feature = "onnx")]
mod onnx {
    use super::InferenceBackend;
    use crate::types::ModelConfig;
    use anyhow::{Context, Result};
    use ndarray::{Array4, ArrayD, IxDyn};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use tracing::{debug, info};

    pub struct OnnxBackend {
        session: Session,
    }

    impl OnnxBackend {
        pub fn new(config: &ModelConfig) -> Result<Self> {
            info!("Initializing ONNX Runtime backend");
            info!("Model path: {}", config.weights);

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(config.num_threads)?
                .with_inter_threads(1)?
                .commit_from_file(&config.weights)
                .context("Failed to load model")?;

            info!("✓ Inference backend initialized");
            Ok(Self { session })
        }
    }

    impl InferenceBackend for OnnxBackend {
        fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
            let shape: Vec<usize> = input.shape().to_vec();
            let data: Vec<f32> = input.iter().copied().collect();
            let input_value =
                ort::value::Value::from_array((shape.as_slice(), data.into_boxed_slice()))?;

            let input_name = self
                .session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .context("Model declares no inputs")?;

            let outputs = self.session.run(ort::inputs![input_name => input_value])?;

            let mut tensors = Vec::with_capacity(outputs.len());
            for idx in 0..outputs.len() {
                let output = &outputs[idx];
                let (output_shape, data_slice) = output.try_extract_tensor::<f32>()?;
                let dims: Vec<usize> = output_shape.iter().map(|&d| d.max(0) as usize).collect();
                debug!("Output {} shape: {:?}", idx, dims);
                tensors.push(ArrayD::from_shape_vec(IxDyn(&dims), data_slice.to_vec())?);
            }

            Ok(tensors)
        }
    }
}

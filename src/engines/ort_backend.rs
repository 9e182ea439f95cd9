//! 张量运行时引擎 (Tensor-Runtime Engine)
//!
//! 基于 ONNX Runtime 的推理实现。执行后端在会话构建时注入, 因此
//! `set_backend` 只记录选择, 于下一次 `load_model` 重建会话时生效,
//! 这不是就地热切换, 调用方契约中已注明。NPU类加速器在本构建未接线,
//! 请求时记录日志并回落CPU (文档化降级策略)。

use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use image::DynamicImage;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, ValueType};
use tracing::{debug, warn};

use super::{select_detections, widen_f16, Backend, EngineError, EngineKind, InferenceEngine};
use crate::tensor::{
    self, InputPrecision, InputTensor, OutputLayout, ScoreMode, DEFAULT_INPUT_SIZE,
};
use crate::Detection;

// YOLO-family ONNX exports bake the score activation into the graph
const SCORE_MODE: ScoreMode = ScoreMode::Probability;

struct LoadedSession {
    session: Session,
    input_name: String,
    output_name: String,
    precision: InputPrecision,
    input_width: u32,
    input_height: u32,
    // None until the output shape is concrete (dynamic exports probe on
    // the first inference)
    layout: Option<OutputLayout>,
}

/// ONNX Runtime 张量运行时引擎
#[derive(Default)]
pub struct OrtEngine {
    loaded: Option<LoadedSession>,
    backend: Backend,
    use_accelerator: bool,
}

impl OrtEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, path: &Path) -> Result<LoadedSession> {
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        // backend is baked into the session here (rebuild semantics)
        match (self.backend, self.use_accelerator) {
            (Backend::Gpu, true) => {
                builder =
                    builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
            }
            (Backend::Npu, true) => {
                warn!("NPU-class accelerator is not wired in this build, degrading to CPU");
            }
            _ => {}
        }

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("failed to load model from {}", path.display()))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| EngineError::Load("model has no inputs".to_string()))?;
        let input_name = input.name.clone();
        let (precision, input_dims) = match &input.input_type {
            ValueType::Tensor { ty, shape, .. } => {
                let precision = match ty {
                    ort::tensor::TensorElementType::Float16 => InputPrecision::F16,
                    ort::tensor::TensorElementType::Float32 => InputPrecision::F32,
                    other => bail!(EngineError::Load(format!(
                        "unsupported input dtype {other:?}"
                    ))),
                };
                let dims: Vec<i64> = shape.iter().copied().collect();
                (precision, dims)
            }
            other => bail!(EngineError::Load(format!(
                "unsupported input value type {other:?}"
            ))),
        };

        // dynamic dims (-1) fall back to the default working resolution
        let (input_height, input_width) = if input_dims.len() == 4 {
            if input_dims[1] > 0 && input_dims[1] != 3 {
                bail!(EngineError::Load(format!(
                    "expected 3-channel input, model declares {} channels",
                    input_dims[1]
                )));
            }
            (
                u32::try_from(input_dims[2]).unwrap_or(DEFAULT_INPUT_SIZE),
                u32::try_from(input_dims[3]).unwrap_or(DEFAULT_INPUT_SIZE),
            )
        } else {
            (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
        };

        let output = session
            .outputs
            .first()
            .ok_or_else(|| EngineError::Load("model has no outputs".to_string()))?;
        let output_name = output.name.clone();
        let layout = match &output.output_type {
            ValueType::Tensor { shape, .. } => {
                let dims: Vec<i64> = shape.iter().copied().collect();
                if dims.iter().all(|&d| d > 0) {
                    let dims: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
                    Some(
                        OutputLayout::probe(&dims)
                            .map_err(|_| EngineError::UnsupportedLayout(dims.clone()))?,
                    )
                } else {
                    debug!(?dims, "dynamic output shape, probing deferred to first run");
                    None
                }
            }
            other => bail!(EngineError::Load(format!(
                "unsupported output value type {other:?}"
            ))),
        };

        debug!(
            path = %path.display(),
            ?precision,
            input_width,
            input_height,
            ?layout,
            "tensor-runtime model loaded"
        );
        Ok(LoadedSession {
            session,
            input_name,
            output_name,
            precision,
            input_width,
            input_height,
            layout,
        })
    }

    fn infer(
        &mut self,
        frame: &DynamicImage,
        conf_threshold: f32,
        iou_threshold: f32,
        allowed_classes: &[u32],
    ) -> Result<Vec<Detection>> {
        let loaded = self.loaded.as_mut().context("no model loaded")?;

        let (tensor, scales) = tensor::preprocess(
            frame,
            loaded.input_width,
            loaded.input_height,
            loaded.precision,
        );
        let outputs = match tensor {
            InputTensor::F32(a) => loaded
                .session
                .run(ort::inputs![loaded.input_name.as_str() => Tensor::from_array(a)?]),
            InputTensor::F16(a) => loaded
                .session
                .run(ort::inputs![loaded.input_name.as_str() => Tensor::from_array(a)?]),
        }
        .map_err(|e| EngineError::Inference(e.to_string()))?;

        let output_name = loaded.output_name.clone();
        let (dims, data): (Vec<usize>, Vec<f32>) = {
            let value = outputs
                .get(output_name.as_str())
                .ok_or_else(|| EngineError::Inference(format!("output '{output_name}' missing")))?;
            // f32 is the common case; fp16 exports widen before decoding
            if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                (shape.iter().map(|&d| d as usize).collect(), data.to_vec())
            } else {
                let (shape, data) = value
                    .try_extract_tensor::<f16>()
                    .map_err(|e| EngineError::Inference(e.to_string()))?;
                (shape.iter().map(|&d| d as usize).collect(), widen_f16(data))
            }
        };
        drop(outputs);

        let layout = match loaded.layout {
            Some(layout) => layout,
            None => {
                let layout = OutputLayout::probe(&dims)
                    .map_err(|_| EngineError::UnsupportedLayout(dims.clone()))?;
                loaded.layout = Some(layout);
                layout
            }
        };

        let candidates = tensor::decode_output(
            &data,
            layout,
            scales,
            conf_threshold,
            allowed_classes,
            SCORE_MODE,
        );
        Ok(select_detections(candidates, conf_threshold, iou_threshold))
    }
}

impl InferenceEngine for OrtEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::TensorRuntime
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        // all-or-nothing: the previous session survives a failed load
        let loaded = self.build(path)?;
        self.loaded = Some(loaded);
        Ok(())
    }

    fn set_backend(&mut self, backend: Backend, use_accelerator: bool) {
        self.backend = backend;
        self.use_accelerator = use_accelerator;
        if self.loaded.is_some() {
            warn!(
                %backend,
                use_accelerator,
                "backend change requires a session rebuild, takes effect on next load_model"
            );
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn input_size(&self) -> (u32, u32) {
        self.loaded
            .as_ref()
            .map(|s| (s.input_width, s.input_height))
            .unwrap_or((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE))
    }

    fn detect(
        &mut self,
        frame: &DynamicImage,
        conf_threshold: f32,
        iou_threshold: f32,
        allowed_classes: &[u32],
    ) -> Vec<Detection> {
        if self.loaded.is_none() || frame.width() == 0 || frame.height() == 0 {
            return Vec::new();
        }
        match self.infer(frame, conf_threshold, iou_threshold, allowed_classes) {
            Ok(detections) => detections,
            Err(e) => {
                warn!(error = %e, "tensor-runtime detect failed, returning empty result");
                Vec::new()
            }
        }
    }
}

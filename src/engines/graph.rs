//! 图执行引擎 (Graph-Executor Engine)
//!
//! 基于 tract-onnx 的经典CNN图执行。加载时将ONNX图优化为可执行计划,
//! 并探测输入精度/尺寸与输出布局。执行目标固定为CPU: 收到GPU/NPU请求时
//! 记录日志并回落CPU, 这是本引擎文档化的降级策略。

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

use super::{select_detections, widen_f16, Backend, EngineError, EngineKind, InferenceEngine};
use crate::tensor::{
    self, InputPrecision, InputTensor, OutputLayout, ScoreMode, DEFAULT_INPUT_SIZE,
};
use crate::Detection;

// YOLO-family ONNX exports bake the score activation into the graph
const SCORE_MODE: ScoreMode = ScoreMode::Probability;

struct LoadedGraph {
    plan: RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>,
    precision: InputPrecision,
    input_width: u32,
    input_height: u32,
    layout: OutputLayout,
}

/// tract-onnx 图执行引擎
#[derive(Default)]
pub struct GraphEngine {
    loaded: Option<LoadedGraph>,
    backend: Backend,
}

impl GraphEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, path: &Path) -> Result<LoadedGraph> {
        let mut model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read model graph from {}", path.display()))?;

        let fact = model.input_fact(0)?.clone();
        let precision = match fact.datum_type.concretize() {
            Some(DatumType::F16) => InputPrecision::F16,
            Some(DatumType::F32) | None => InputPrecision::F32,
            Some(other) => bail!(EngineError::Load(format!(
                "unsupported input dtype {other:?}"
            ))),
        };

        // declared NCHW spatial size; dynamic dims pin to the default so the
        // graph can be optimized to a fixed plan
        let dims: Vec<usize> = fact
            .shape
            .concretize()
            .map(|dims| dims.iter().filter_map(|d| d.to_usize().ok()).collect())
            .unwrap_or_default();
        let (input_height, input_width) = if dims.len() == 4 {
            if dims[1] != 3 {
                bail!(EngineError::Load(format!(
                    "expected 3-channel input, model declares {} channels",
                    dims[1]
                )));
            }
            (dims[2] as u32, dims[3] as u32)
        } else {
            (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
        };

        let dt = match precision {
            InputPrecision::F32 => f32::datum_type(),
            InputPrecision::F16 => DatumType::F16,
        };
        model.set_input_fact(
            0,
            InferenceFact::dt_shape(
                dt,
                tvec!(1, 3, input_height as usize, input_width as usize),
            ),
        )?;

        let typed = model.into_optimized()?;
        let output_dims = typed
            .output_fact(0)?
            .shape
            .as_concrete()
            .map(|s| s.to_vec())
            .ok_or_else(|| EngineError::Load("output shape is not concrete".to_string()))?;
        let layout = OutputLayout::probe(&output_dims)
            .map_err(|_| EngineError::UnsupportedLayout(output_dims.clone()))?;
        let plan = typed.into_runnable()?;

        debug!(
            path = %path.display(),
            ?precision,
            input_width,
            input_height,
            ?layout,
            "graph engine model loaded"
        );
        Ok(LoadedGraph {
            plan,
            precision,
            input_width,
            input_height,
            layout,
        })
    }

    fn infer(
        &self,
        frame: &DynamicImage,
        conf_threshold: f32,
        iou_threshold: f32,
        allowed_classes: &[u32],
    ) -> Result<Vec<Detection>> {
        let graph = self.loaded.as_ref().context("no model loaded")?;

        let (tensor, scales) = tensor::preprocess(
            frame,
            graph.input_width,
            graph.input_height,
            graph.precision,
        );
        let input = match tensor {
            InputTensor::F32(a) => {
                Tensor::from_shape(a.shape(), a.as_slice().context("non-contiguous tensor")?)?
            }
            InputTensor::F16(a) => {
                Tensor::from_shape(a.shape(), a.as_slice().context("non-contiguous tensor")?)?
            }
        };

        let outputs = graph
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| EngineError::Inference("model produced no outputs".to_string()))?;

        let widened;
        let data: &[f32] = if output.datum_type() == DatumType::F16 {
            widened = widen_f16(output.as_slice::<half::f16>()?);
            &widened
        } else {
            output.as_slice::<f32>()?
        };

        let candidates = decode(data, graph.layout, scales, conf_threshold, allowed_classes);
        Ok(select_detections(candidates, conf_threshold, iou_threshold))
    }
}

fn decode(
    data: &[f32],
    layout: OutputLayout,
    scales: tensor::ScaleFactors,
    conf_threshold: f32,
    allowed_classes: &[u32],
) -> Vec<tensor::Candidate> {
    tensor::decode_output(data, layout, scales, conf_threshold, allowed_classes, SCORE_MODE)
}

impl InferenceEngine for GraphEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Graph
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        // all-or-nothing: the previous plan survives a failed load
        let graph = self.build(path)?;
        self.loaded = Some(graph);
        Ok(())
    }

    fn set_backend(&mut self, backend: Backend, use_accelerator: bool) {
        if use_accelerator && backend != Backend::Cpu {
            warn!(%backend, "graph engine executes on CPU; accelerator request degrades to CPU");
        }
        self.backend = backend;
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn input_size(&self) -> (u32, u32) {
        self.loaded
            .as_ref()
            .map(|g| (g.input_width, g.input_height))
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
                warn!(error = %e, "graph engine detect failed, returning empty result");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unloaded_detect_is_empty() {
        let mut engine = GraphEngine::new();
        let frame = DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
        assert!(engine.detect(&frame, 0.5, 0.45, &[]).is_empty());
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let mut engine = GraphEngine::new();
        assert!(engine.load_model(Path::new("/nonexistent/model.onnx")).is_err());
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_default_input_size_when_unloaded() {
        let engine = GraphEngine::new();
        assert_eq!(engine.input_size(), (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE));
    }
}

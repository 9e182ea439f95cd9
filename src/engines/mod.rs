//! 推理引擎抽象 (Inference Engine)
//!
//! # 架构说明
//!
//! 统一的能力接口 {load_model, set_backend, detect}, 两种可互换实现:
//!
//! - **GraphEngine** (`graph.rs`): tract-onnx 经典图执行, 纯CPU
//! - **OrtEngine** (`ort_backend.rs`): ONNX Runtime 张量运行时,
//!   支持执行后端选择 (切换需重建会话, 于下次load_model生效)
//!
//! 两者各自持有模型/会话状态, 输出张量布局在加载时探测而非硬编码。
//! `detect` 对调用方永不抛错: 未加载/空帧/运行期故障一律退化为空结果。

pub mod graph;
pub mod ort_backend;

use std::fmt;
use std::path::Path;

use anyhow::Result;
use image::DynamicImage;
use thiserror::Error;

pub use graph::GraphEngine;
pub use ort_backend::OrtEngine;

use crate::tensor::Candidate;
use crate::{labels, nms_indices, Bbox, CoordSpace, Detection};

/// 引擎变体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// 经典CNN图执行 (tract-onnx)
    Graph,
    /// 张量运行时执行 (ONNX Runtime)
    TensorRuntime,
}

impl EngineKind {
    /// Parse an engine name from the configuration surface.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "graph" | "tract" => Some(EngineKind::Graph),
            "onnxruntime" | "ort" | "tensor" => Some(EngineKind::TensorRuntime),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Graph => write!(f, "graph"),
            EngineKind::TensorRuntime => write!(f, "onnxruntime"),
        }
    }
}

/// 执行后端 (CPU / GPU / NPU类加速器)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
    Npu,
}

impl Backend {
    /// Backend names are matched loosely ("GPU (OpenCL)" selects Gpu);
    /// anything unrecognized falls back to Cpu.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("gpu") || name.contains("cuda") || name.contains("opencl") {
            Backend::Gpu
        } else if name.contains("npu") || name.contains("nnapi") {
            Backend::Npu
        } else {
            Backend::Cpu
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Gpu => write!(f, "gpu"),
            Backend::Npu => write!(f, "npu"),
        }
    }
}

/// 引擎错误分类
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("unrecognized output tensor layout {0:?}")]
    UnsupportedLayout(Vec<usize>),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// 推理引擎能力接口
///
/// `load_model` 全有或全无: 失败时保留先前已加载的会话 (last known good)。
/// `detect` 在单次推理期间借用帧, 返回像素坐标的最终检测。
pub trait InferenceEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Parse/load the model file, allocate session state, probe input
    /// precision, input size and output layout.
    fn load_model(&mut self, path: &Path) -> Result<()>;

    /// Reconfigure the execution target. Engines that need a session
    /// rebuild document the deferred effect on their implementation.
    fn set_backend(&mut self, backend: Backend, use_accelerator: bool);

    fn is_loaded(&self) -> bool;

    /// (width, height) of the loaded model input; default size when unloaded.
    fn input_size(&self) -> (u32, u32);

    /// preprocess → inference → decode → NMS. Empty result when no model
    /// is loaded, the frame is empty, or the backend call fails.
    fn detect(
        &mut self,
        frame: &DynamicImage,
        conf_threshold: f32,
        iou_threshold: f32,
        allowed_classes: &[u32],
    ) -> Vec<Detection>;
}

/// NMS + 贴标签: 候选框 → 最终检测 (按接受顺序)
pub(crate) fn select_detections(
    candidates: Vec<Candidate>,
    conf_threshold: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    let boxes: Vec<Bbox> = candidates.iter().map(|c| c.bbox.clone()).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
    nms_indices(&boxes, &scores, conf_threshold, iou_threshold)
        .into_iter()
        .map(|idx| {
            let c = &candidates[idx];
            Detection {
                label: labels::class_label(c.class_id).to_string(),
                class_id: c.class_id,
                confidence: c.score,
                bbox: c.bbox.clone(),
                space: CoordSpace::Pixel,
            }
        })
        .collect()
}

/// f16输出拓宽为f32后走统一解码路径
pub(crate) fn widen_f16(data: &[half::f16]) -> Vec<f32> {
    data.iter().map(|v| v.to_f32()).collect()
}

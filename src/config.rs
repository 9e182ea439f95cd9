//! 运行配置 (Configuration)

use std::path::PathBuf;

use clap::Parser;

use crate::engines::{Backend, EngineKind};
use crate::filters::FilterKind;

/// 工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// 仅采集/滤镜, 不做推理
    Passthrough,
    /// 推理开启
    #[default]
    Detect,
    /// 帧交由外部消费方分析, 本核不推理
    External,
}

impl ProcessingMode {
    /// Host surface passes modes as small integers; unknown values keep
    /// the current default.
    pub fn from_index(index: i32) -> Self {
        match index {
            0 => ProcessingMode::Passthrough,
            1 => ProcessingMode::Detect,
            2 => ProcessingMode::External,
            _ => ProcessingMode::default(),
        }
    }
}

/// 进程级共享配置: 每个处理周期读取, 仅经注册表入口写入
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_path: Option<PathBuf>,
    pub engine: EngineKind,
    pub backend: Backend,
    pub use_accelerator: bool,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    /// 空表示接受所有类别
    pub allowed_classes: Vec<u32>,
    pub mode: ProcessingMode,
    pub filter: FilterKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            engine: EngineKind::Graph,
            backend: Backend::Cpu,
            use_accelerator: false,
            conf_threshold: 0.5,
            iou_threshold: 0.45,
            allowed_classes: Vec::new(),
            mode: ProcessingMode::default(),
            filter: FilterKind::None,
        }
    }
}

/// 命令行参数 (live演示程序)
#[derive(Parser, Debug, Clone)]
#[command(about = "Real-time camera detection pipeline demo")]
pub struct Args {
    /// ONNX model path
    #[arg(long, default_value = "")]
    pub model: String,

    /// Inference engine: graph | onnxruntime
    #[arg(long, default_value = "graph")]
    pub engine: String,

    /// Compute backend: cpu | gpu | npu
    #[arg(long, default_value = "cpu")]
    pub backend: String,

    /// Request hardware acceleration on the selected backend
    #[arg(long, default_value_t = false)]
    pub accelerate: bool,

    /// Confidence threshold
    #[arg(long, default_value_t = 0.5)]
    pub conf: f32,

    /// IoU threshold for NMS
    #[arg(long, default_value_t = 0.45)]
    pub iou: f32,

    /// Comma-separated class-id allow-list (empty = all classes)
    #[arg(long, value_delimiter = ',')]
    pub classes: Vec<u32>,

    /// Cosmetic filter: none | gray | blur | histeq | binary | stage
    #[arg(long, default_value = "none")]
    pub filter: String,

    /// Image file or directory used as the frame source (empty = synthetic)
    #[arg(long, default_value = "")]
    pub source: String,

    /// Number of frames the synthetic source produces
    #[arg(long, default_value_t = 30)]
    pub frames: u32,

    /// Save annotated snapshots into this directory
    #[arg(long)]
    pub save_dir: Option<String>,

    /// TTF font for label text (boxes draw without it)
    #[arg(long)]
    pub font: Option<String>,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_path: (!self.model.is_empty()).then(|| PathBuf::from(&self.model)),
            engine: EngineKind::from_name(&self.engine).unwrap_or(EngineKind::Graph),
            backend: Backend::from_name(&self.backend),
            use_accelerator: self.accelerate,
            conf_threshold: self.conf,
            iou_threshold: self.iou,
            allowed_classes: self.classes.clone(),
            mode: ProcessingMode::Detect,
            filter: FilterKind::from_name(&self.filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_index() {
        assert_eq!(ProcessingMode::from_index(0), ProcessingMode::Passthrough);
        assert_eq!(ProcessingMode::from_index(1), ProcessingMode::Detect);
        assert_eq!(ProcessingMode::from_index(2), ProcessingMode::External);
        assert_eq!(ProcessingMode::from_index(99), ProcessingMode::Detect);
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.engine, EngineKind::Graph);
        assert_eq!(config.conf_threshold, 0.5);
        assert_eq!(config.iou_threshold, 0.45);
        assert!(config.allowed_classes.is_empty());
    }
}

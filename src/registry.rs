//! 引擎注册表 / 生命周期管理 (Engine Registry)
//!
//! 显式上下文对象, 持有互斥保护的引擎槽位与共享配置, 不是全局单例。
//! 所有变更入口在同一互斥域内串行; `detect` 在整个推理期间持锁,
//! 因此并发的 switch/release 不可能释放一个推理中的引擎实例
//! (要么detect先在旧引擎上完成, 要么等切换结束, 绝无 use-after-release)。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use image::DynamicImage;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, ProcessingMode};
use crate::engines::{Backend, EngineKind, GraphEngine, InferenceEngine, OrtEngine};
use crate::filters::FilterKind;
use crate::Detection;

/// 生命周期状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Uninitialized,
    Loaded,
    Reloading,
    Released,
}

struct Slot {
    engine: Option<Box<dyn InferenceEngine>>,
    config: EngineConfig,
    state: EngineState,
    /// 实际装载成功的模型路径 (config.model_path 是待定配置)
    loaded_path: Option<PathBuf>,
}

/// 引擎注册表
pub struct EngineRegistry {
    slot: Mutex<Slot>,
}

fn make_engine(kind: EngineKind) -> Box<dyn InferenceEngine> {
    match kind {
        EngineKind::Graph => Box::new(GraphEngine::new()),
        EngineKind::TensorRuntime => Box::new(OrtEngine::new()),
    }
}

impl EngineRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            slot: Mutex::new(Slot {
                engine: None,
                config,
                state: EngineState::Uninitialized,
                loaded_path: None,
            }),
        }
    }

    // a panicking detect must not wedge every later frame cycle
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 初始化: 无引擎时默认图执行引擎, 加载模型并应用最近的后端选择。
    /// 同一路径的重入只重新应用后端 (幂等)。
    pub fn initialize(&self, model_path: &Path) -> bool {
        let mut slot = self.slot();
        slot.config.model_path = Some(model_path.to_path_buf());

        if slot.engine.is_none() {
            let kind = slot.config.engine;
            slot.engine = Some(make_engine(kind));
        }

        if slot.state == EngineState::Loaded && slot.loaded_path.as_deref() == Some(model_path) {
            let (backend, accel) = (slot.config.backend, slot.config.use_accelerator);
            if let Some(engine) = slot.engine.as_mut() {
                engine.set_backend(backend, accel);
            }
            return true;
        }

        Self::load_into_slot(&mut slot, model_path)
    }

    /// 切换引擎变体。已激活同一变体时为no-op; 否则构造新实例, 若此前
    /// 设置过模型路径则立即加载并重应用后端。加载失败通过返回值暴露,
    /// 槽位持有的是未加载的新实例, 绝不留下陈旧引擎冒充当前实例。
    pub fn switch_engine(&self, kind: EngineKind) -> bool {
        let mut slot = self.slot();
        if slot.config.engine == kind && slot.engine.is_some() {
            return true;
        }
        info!(engine = %kind, "switching inference engine");
        slot.config.engine = kind;
        slot.engine = Some(make_engine(kind));
        slot.loaded_path = None;
        slot.state = EngineState::Uninitialized;

        match slot.config.model_path.clone() {
            Some(path) => Self::load_into_slot(&mut slot, &path),
            None => true,
        }
    }

    fn load_into_slot(slot: &mut Slot, path: &Path) -> bool {
        slot.state = EngineState::Reloading;
        let (backend, accel) = (slot.config.backend, slot.config.use_accelerator);
        let Some(engine) = slot.engine.as_mut() else {
            slot.state = EngineState::Uninitialized;
            return false;
        };
        match engine.load_model(path) {
            Ok(()) => {
                engine.set_backend(backend, accel);
                slot.loaded_path = Some(path.to_path_buf());
                slot.state = EngineState::Loaded;
                info!(path = %path.display(), "model loaded");
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "model load failed");
                // a failed re-load of the same engine keeps its previous
                // session intact (all-or-nothing inside the engine)
                slot.state = if engine.is_loaded() {
                    EngineState::Loaded
                } else {
                    slot.loaded_path = None;
                    EngineState::Uninitialized
                };
                false
            }
        }
    }

    /// 设置执行后端; 立即转发给当前引擎 (各变体自述其生效时机)。
    pub fn set_backend(&self, backend: Backend, use_accelerator: bool) {
        let mut slot = self.slot();
        slot.config.backend = backend;
        slot.config.use_accelerator = use_accelerator;
        if let Some(engine) = slot.engine.as_mut() {
            engine.set_backend(backend, use_accelerator);
        }
    }

    pub fn set_thresholds(&self, conf_threshold: f32, iou_threshold: f32) {
        let mut slot = self.slot();
        slot.config.conf_threshold = conf_threshold;
        slot.config.iou_threshold = iou_threshold;
    }

    pub fn set_allowed_classes(&self, allowed_classes: Vec<u32>) {
        self.slot().config.allowed_classes = allowed_classes;
    }

    pub fn set_mode(&self, mode: ProcessingMode) {
        self.slot().config.mode = mode;
    }

    pub fn mode(&self) -> ProcessingMode {
        self.slot().config.mode
    }

    pub fn set_filter(&self, filter: FilterKind) {
        self.slot().config.filter = filter;
    }

    pub fn filter(&self) -> FilterKind {
        self.slot().config.filter
    }

    /// 当前配置快照
    pub fn config(&self) -> EngineConfig {
        self.slot().config.clone()
    }

    pub fn state(&self) -> EngineState {
        self.slot().state
    }

    pub fn active_engine(&self) -> Option<EngineKind> {
        self.slot().engine.as_ref().map(|e| e.kind())
    }

    /// 以当前共享配置执行一次检测。锁覆盖整个推理时长。
    pub fn detect(&self, frame: &DynamicImage) -> Vec<Detection> {
        let mut slot = self.slot();
        if slot.state != EngineState::Loaded {
            return Vec::new();
        }
        let conf = slot.config.conf_threshold;
        let iou = slot.config.iou_threshold;
        let allowed = slot.config.allowed_classes.clone();
        match slot.engine.as_mut() {
            Some(engine) => engine.detect(frame, conf, iou, &allowed),
            None => Vec::new(),
        }
    }

    /// 销毁当前引擎实例, 释放全部后端资源 (RAII)。
    /// 之后的 `detect` 表现为"未加载" (空结果), 不会崩溃。
    pub fn release(&self) {
        let mut slot = self.slot();
        if slot.engine.take().is_some() {
            info!("inference engine released");
        } else {
            warn!("release called with no active engine");
        }
        slot.loaded_path = None;
        slot.state = EngineState::Released;
    }
}

//! 流水线工作线程 (Pipeline worker)
//!
//! 职责: 信箱取帧 → 滤镜 → (按模式)推理 → 发布结果与指标。
//! 推理在本线程内同步执行, 允许慢; 渲染读的是上一次发布的快照,
//! 不被推理阻塞。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::DynamicImage;
use tracing::{debug, info};

use super::{CapturedFrame, FpsCounter, FrameMailbox};
use crate::channel::{MetricsBuffer, PerfMetrics, ResultChannel};
use crate::config::ProcessingMode;
use crate::filters::FilterEngine;
use crate::registry::EngineRegistry;

const TAKE_TIMEOUT: Duration = Duration::from_millis(100);

/// 帧处理工作者
pub struct PipelineWorker {
    registry: Arc<EngineRegistry>,
    results: Arc<ResultChannel>,
    metrics: Arc<MetricsBuffer>,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    filters: FilterEngine,
    fps: FpsCounter,
}

impl PipelineWorker {
    pub fn new(
        registry: Arc<EngineRegistry>,
        results: Arc<ResultChannel>,
        metrics: Arc<MetricsBuffer>,
        mailbox: Arc<FrameMailbox>,
    ) -> Self {
        Self {
            registry,
            results,
            metrics,
            mailbox,
            stop: Arc::new(AtomicBool::new(false)),
            filters: FilterEngine::new(),
            fps: FpsCounter::new(),
        }
    }

    /// 停止句柄: 置位后工作循环在当前帧处理完后退出。
    /// 在飞检测总是跑完, 引擎释放经注册表锁与detect串行化。
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// 处理一帧 (滤镜后的帧返回给调用方用于呈现)。
    pub fn process_frame(&mut self, frame: CapturedFrame) -> image::RgbaImage {
        let mut image = frame.image;
        let filter = self.registry.filter();
        self.filters.apply(filter, &mut image);

        let fps = self.fps.tick() as f32;
        let (width, height) = (image.width(), image.height());

        match self.registry.mode() {
            ProcessingMode::Detect => {
                let started = Instant::now();
                let detections = self.registry.detect(&DynamicImage::ImageRgba8(image.clone()));
                let inference_ms = started.elapsed().as_secs_f64() as f32 * 1000.0;
                debug!(
                    frame_id = frame.frame_id,
                    count = detections.len(),
                    inference_ms,
                    "frame processed"
                );
                self.results.publish(detections);
                self.metrics.publish(PerfMetrics {
                    fps,
                    inference_ms,
                    frame_width: width,
                    frame_height: height,
                });
            }
            // inference off: clear stale overlays, keep the metrics fresh
            ProcessingMode::Passthrough | ProcessingMode::External => {
                self.results.publish(Vec::new());
                self.metrics.publish(PerfMetrics {
                    fps,
                    inference_ms: 0.0,
                    frame_width: width,
                    frame_height: height,
                });
            }
        }
        image
    }

    /// 工作循环主体 (在专用线程上运行)。
    pub fn run(mut self) {
        info!("pipeline worker started");
        while !self.stop.load(Ordering::Relaxed) {
            let Some(frame) = self.mailbox.take(TAKE_TIMEOUT) else {
                continue;
            };
            self.process_frame(frame);
        }
        info!("pipeline worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }
}

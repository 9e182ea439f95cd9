//! 帧处理流水线 (Frame pipeline)
//!
//! 单生产者架构: 相机边界把帧投进信箱, 专用工作线程同步完成
//! 滤镜 → 推理 → 发布。信箱只存最新一帧, 生产跟不上时旧帧被丢弃,
//! 绝不排队, 内存与延迟有界。渲染/UI各自按节奏消费最近发布的快照。

pub mod worker;

use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbaImage;

pub use worker::PipelineWorker;

/// 采集帧 (相机边界 → 处理线程)
#[derive(Clone)]
pub struct CapturedFrame {
    pub image: RgbaImage,
    pub frame_id: u64,
}

/// 相机边界: 核心只索取"下一可用帧", 不拥有设备生命周期。
/// 返回 `None` 表示源枯竭/停止。
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<CapturedFrame>;
}

/// 单槽信箱: 仅保留最新一帧
pub struct FrameMailbox {
    tx: Sender<CapturedFrame>,
    rx: Receiver<CapturedFrame>,
}

impl Default for FrameMailbox {
    fn default() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 投递一帧; 信箱已满时丢弃旧帧 (drop-oldest)。
    pub fn offer(&self, frame: CapturedFrame) {
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// 取最新帧, 最多等待 `timeout`; 无帧时返回 `None`。
    pub fn take(&self, timeout: std::time::Duration) -> Option<CapturedFrame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_take(&self) -> Option<CapturedFrame> {
        self.rx.try_recv().ok()
    }
}

/// 滑动一秒窗口的FPS统计
pub struct FpsCounter {
    count: u64,
    window_start: Instant,
    current_fps: f64,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            current_fps: 0.0,
        }
    }
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记一帧, 返回当前FPS (窗口满一秒后更新)。
    pub fn tick(&mut self) -> f64 {
        self.count += 1;
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.current_fps = self.count as f64 / elapsed;
            self.count = 0;
            self.window_start = Instant::now();
        }
        self.current_fps
    }

    pub fn current(&self) -> f64 {
        self.current_fps
    }
}

//! 结果通道 (Result Channel)
//!
//! 生产者(帧处理线程) → 消费者(渲染/UI轮询)的最新值交接。
//! 发布是整体覆盖, 消费是同锁快照, 读者可能略旧, 绝不撕裂。
//! 无队列: 仅保留最近一次发布的记录, 内存与延迟有界。
//! 检测结果与性能指标各自独立加锁, 慢推理不会阻塞指标读取。

use std::sync::Mutex;

use crate::Detection;

/// 每条检测在二进制导出里的字段数: id, conf, x, y, w, h
const RECORD_FIELDS: usize = 6;

/// 最新检测结果缓冲
#[derive(Default)]
pub struct ResultChannel {
    latest: Mutex<Vec<Detection>>,
}

impl ResultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Detection>> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 整体替换上一次的结果集 (覆盖语义, 不合并不排队)。
    pub fn publish(&self, results: Vec<Detection>) {
        *self.lock() = results;
    }

    /// 快照读取, 最多 `max_results` 条; 不阻塞生产者的下一次发布。
    pub fn consume(&self, max_results: usize) -> Vec<Detection> {
        let guard = self.lock();
        guard.iter().take(max_results).cloned().collect()
    }

    /// 宿主UI消费的JSON数组
    pub fn to_json(&self) -> String {
        let guard = self.lock();
        serde_json::to_string(&*guard).unwrap_or_else(|_| "[]".to_string())
    }

    /// 平板二进制导出: `[count, id, conf, x, y, w, h, ...]`。
    ///
    /// 截断策略: 超出 `out` 容量的检测被丢弃, count 被钳制为实际写入的
    /// 条数, 不写半条记录, 不越界。返回写入的元素个数
    /// (= min(1 + 6*count, capacity), 向下取整到整条记录)。
    pub fn export_binary(&self, out: &mut [f32]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let guard = self.lock();
        let fit = guard.len().min((out.len() - 1) / RECORD_FIELDS);
        out[0] = fit as f32;
        for (i, det) in guard.iter().take(fit).enumerate() {
            let base = 1 + i * RECORD_FIELDS;
            out[base] = det.class_id as f32;
            out[base + 1] = det.confidence;
            out[base + 2] = det.bbox.xmin();
            out[base + 3] = det.bbox.ymin();
            out[base + 4] = det.bbox.width();
            out[base + 5] = det.bbox.height();
        }
        1 + fit * RECORD_FIELDS
    }
}

/// 性能指标记录
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerfMetrics {
    pub fps: f32,
    pub inference_ms: f32,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// 最新性能指标缓冲 (与检测结果同构的发布/消费模式, 独立锁)
#[derive(Default)]
pub struct MetricsBuffer {
    latest: Mutex<PerfMetrics>,
}

impl MetricsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PerfMetrics> {
        self.latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, metrics: PerfMetrics) {
        *self.lock() = metrics;
    }

    pub fn consume(&self) -> PerfMetrics {
        *self.lock()
    }

    /// 固定4元导出: `[fps, last_inference_ms, frame_w, frame_h]`
    pub fn export(&self) -> [f32; 4] {
        let m = self.consume();
        [
            m.fps,
            m.inference_ms,
            m.frame_width as f32,
            m.frame_height as f32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bbox, CoordSpace};

    fn det(class_id: u32, confidence: f32, x: f32) -> Detection {
        Detection {
            label: crate::labels::class_label(class_id).to_string(),
            class_id,
            confidence,
            bbox: Bbox::new(x, 10.0, 20.0, 30.0),
            space: CoordSpace::Pixel,
        }
    }

    #[test]
    fn test_publish_overwrites_wholesale() {
        let channel = ResultChannel::new();
        channel.publish(vec![det(0, 0.9, 1.0), det(2, 0.8, 2.0)]);
        assert_eq!(channel.consume(16).len(), 2);

        // publishing empty clears everything previously visible
        channel.publish(Vec::new());
        assert!(channel.consume(16).is_empty());

        let mut out = [0.0f32; 16];
        assert_eq!(channel.export_binary(&mut out), 1);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_consume_truncates_to_max() {
        let channel = ResultChannel::new();
        channel.publish(vec![det(0, 0.9, 1.0), det(1, 0.8, 2.0), det(2, 0.7, 3.0)]);
        assert_eq!(channel.consume(2).len(), 2);
        assert_eq!(channel.consume(0).len(), 0);
    }

    #[test]
    fn test_export_binary_layout() {
        let channel = ResultChannel::new();
        channel.publish(vec![det(2, 0.75, 5.0)]);
        let mut out = [0.0f32; 7];
        let written = channel.export_binary(&mut out);
        assert_eq!(written, 7);
        assert_eq!(out[0], 1.0); // count
        assert_eq!(out[1], 2.0); // class id
        assert_eq!(out[2], 0.75); // confidence
        assert_eq!(out[3], 5.0); // x
        assert_eq!(out[4], 10.0); // y
        assert_eq!(out[5], 20.0); // w
        assert_eq!(out[6], 30.0); // h
    }

    #[test]
    fn test_export_binary_clamps_to_capacity() {
        let channel = ResultChannel::new();
        channel.publish(vec![det(0, 0.9, 1.0), det(1, 0.8, 2.0), det(2, 0.7, 3.0)]);

        // room for one full record plus a few spare floats: no partial write
        let mut out = [0.0f32; 10];
        let written = channel.export_binary(&mut out);
        assert_eq!(written, 7);
        assert_eq!(out[0], 1.0); // clamped count
        assert_eq!(out[7], 0.0);

        let mut empty: [f32; 0] = [];
        assert_eq!(channel.export_binary(&mut empty), 0);
    }

    #[test]
    fn test_metrics_publish_consume() {
        let metrics = MetricsBuffer::new();
        assert_eq!(metrics.consume(), PerfMetrics::default());
        metrics.publish(PerfMetrics {
            fps: 29.5,
            inference_ms: 42.0,
            frame_width: 1280,
            frame_height: 720,
        });
        assert_eq!(metrics.export(), [29.5, 42.0, 1280.0, 720.0]);
    }
}

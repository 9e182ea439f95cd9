//! 实时检测演示程序
//!
//! 帧源: 图片文件/目录, 或程序生成的渐变帧。帧以约30fps投入流水线,
//! 结束后打印最近一次发布的检测JSON与性能指标, 可选保存标注快照。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use image::RgbaImage;
use tracing::{info, warn};

use camsight::annotate;
use camsight::channel::{MetricsBuffer, ResultChannel};
use camsight::pipeline::{CapturedFrame, FrameMailbox, FrameSource, PipelineWorker};
use camsight::registry::EngineRegistry;
use camsight::{gen_time_string, Args};

/// 图片文件/目录帧源
struct ImageSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSource {
    fn new(source: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if source.is_dir() {
            for entry in std::fs::read_dir(source)? {
                let path = entry?.path();
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "bmp") {
                    paths.push(path);
                }
            }
            paths.sort();
        } else {
            paths.push(source.to_path_buf());
        }
        if paths.is_empty() {
            anyhow::bail!("no readable images under {}", source.display());
        }
        Ok(Self { paths, next: 0 })
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Option<CapturedFrame> {
        while self.next < self.paths.len() {
            let path = &self.paths[self.next];
            self.next += 1;
            match image::open(path) {
                Ok(img) => {
                    return Some(CapturedFrame {
                        image: img.to_rgba8(),
                        frame_id: self.next as u64,
                    })
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable image"),
            }
        }
        None
    }
}

/// 渐变测试帧源 (无相机/素材时使用)
struct SyntheticSource {
    remaining: u32,
    frame_id: u64,
}

impl SyntheticSource {
    fn new(frames: u32) -> Self {
        Self {
            remaining: frames,
            frame_id: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Option<CapturedFrame> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.frame_id += 1;
        let shift = (self.frame_id % 255) as u8;
        let image = RgbaImage::from_fn(640, 480, |x, y| {
            image::Rgba([
                (x % 256) as u8,
                (y % 256) as u8,
                shift,
                255,
            ])
        });
        Some(CapturedFrame {
            image,
            frame_id: self.frame_id,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = args.engine_config();
    let engine = config.engine;

    let registry = Arc::new(EngineRegistry::new(config));
    let results = Arc::new(ResultChannel::new());
    let metrics = Arc::new(MetricsBuffer::new());
    let mailbox = Arc::new(FrameMailbox::new());

    if !args.model.is_empty() {
        if registry.initialize(Path::new(&args.model)) {
            info!(model = %args.model, engine = %engine, "detector ready");
        } else {
            warn!(model = %args.model, "model load failed, running without inference");
        }
    } else {
        info!("no model given, frames pass through without detection");
    }

    let mut source: Box<dyn FrameSource> = if args.source.is_empty() {
        Box::new(SyntheticSource::new(args.frames))
    } else {
        Box::new(ImageSource::new(Path::new(&args.source))?)
    };

    let worker = PipelineWorker::new(
        registry.clone(),
        results.clone(),
        metrics.clone(),
        mailbox.clone(),
    );
    let stop = worker.stop_handle();
    let handle = worker.spawn();

    // 按传感器节奏投帧; 处理慢时信箱丢旧帧
    let mut last_frame: Option<RgbaImage> = None;
    while let Some(frame) = source.next_frame() {
        last_frame = Some(frame.image.clone());
        mailbox.offer(frame);
        std::thread::sleep(Duration::from_millis(33));
    }

    // drain: give the worker a beat to finish the final frame
    std::thread::sleep(Duration::from_millis(200));
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.join().ok();

    let m = metrics.export();
    println!("detections: {}", results.to_json());
    println!(
        "metrics: fps={:.1} inference={:.1}ms frame={}x{}",
        m[0], m[1], m[2] as u32, m[3] as u32
    );

    if let (Some(dir), Some(mut image)) = (args.save_dir.as_ref(), last_frame.take()) {
        std::fs::create_dir_all(dir)?;
        let detections = results.consume(64);
        match args.font.as_ref().map(std::fs::read).transpose()? {
            Some(bytes) => {
                let font = ab_glyph::FontRef::try_from_slice(&bytes)
                    .ok()
                    .context("failed to parse font file")?;
                annotate::draw_detections_labeled(&mut image, &detections, &font);
            }
            None => annotate::draw_detections(&mut image, &detections),
        }
        let out = Path::new(dir).join(format!("snapshot_{}.png", gen_time_string("-")));
        image.save(&out)
            .with_context(|| format!("failed to save snapshot to {}", out.display()))?;
        info!(path = %out.display(), "annotated snapshot saved");
    }

    registry.release();
    Ok(())
}

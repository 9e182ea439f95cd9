//! 张量预处理/后处理 (Tensor Pre/Post-Processor)
//!
//! 像素帧 → 网络输入张量 的正变换, 以及 网络原始输出 → 候选框 的逆变换。
//! 两个方向共用同一组缩放系数, 非正方形输入帧经简单缩放进入模型,
//! 坐标还原时按轴分别补偿。

use anyhow::{bail, Result};
use half::f16;
use image::DynamicImage;
use ndarray::{Array, ArrayD};

use crate::Bbox;

/// 模型默认输入尺寸 (正方形)
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Numeric precision the loaded model declares for its input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPrecision {
    F32,
    F16,
}

/// Input tensor in NCHW layout, carrying its declared precision.
pub enum InputTensor {
    F32(ArrayD<f32>),
    F16(ArrayD<f16>),
}

impl InputTensor {
    pub fn precision(&self) -> InputPrecision {
        match self {
            InputTensor::F32(_) => InputPrecision::F32,
            InputTensor::F16(_) => InputPrecision::F16,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            InputTensor::F32(a) => a.shape(),
            InputTensor::F16(a) => a.shape(),
        }
    }
}

/// Per-axis ratios between the source frame and the model's working
/// resolution. Applied on the way back out so boxes land in source pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub x: f32,
    pub y: f32,
}

impl ScaleFactors {
    pub fn new(frame_width: u32, frame_height: u32, target_width: u32, target_height: u32) -> Self {
        Self {
            x: frame_width as f32 / target_width as f32,
            y: frame_height as f32 / target_height as f32,
        }
    }
}

/// 预处理: 帧 → NCHW张量
///
/// - alpha通道丢弃, 统一为RGB三通道
/// - 简单缩放到模型输入尺寸 (不保持宽高比, 由 [`ScaleFactors`] 在还原时补偿)
/// - [0,255] → [0,1]
/// - HWC交错布局 → CHW平面布局: dst[c*H*W + y*W + x]
/// - 按引擎声明的精度输出 f32 或 IEEE754-half
pub fn preprocess(
    frame: &DynamicImage,
    target_width: u32,
    target_height: u32,
    precision: InputPrecision,
) -> (InputTensor, ScaleFactors) {
    let scales = ScaleFactors::new(frame.width(), frame.height(), target_width, target_height);

    let resized = frame
        .resize_exact(
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();

    let (w, h) = (target_width as usize, target_height as usize);
    let mut ys = Array::zeros((1, 3, h, w)).into_dyn();
    for (x, y, rgb) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = rgb.0;
        ys[[0, 0, y, x]] = (r as f32) / 255.0;
        ys[[0, 1, y, x]] = (g as f32) / 255.0;
        ys[[0, 2, y, x]] = (b as f32) / 255.0;
    }

    let tensor = match precision {
        InputPrecision::F32 => InputTensor::F32(ys),
        // value-preserving bit conversion, not a truncation
        InputPrecision::F16 => InputTensor::F16(ys.mapv(f16::from_f32)),
    };
    (tensor, scales)
}

/// Raw output tensor layout, probed from the model's declared output shape.
///
/// Different export paths transpose the two trailing dimensions; offsets
/// must never be hardcoded against one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[1, 4+nc, anchors]`: box rows first (YOLOv8 export default)
    AttrsFirst {
        num_classes: usize,
        num_anchors: usize,
    },
    /// `[1, anchors, 4+nc]`: transposed export
    AnchorsFirst {
        num_classes: usize,
        num_anchors: usize,
    },
}

impl OutputLayout {
    /// Probe the layout from a concrete output shape, failing loudly on
    /// anything unrecognized.
    ///
    /// The attribute dimension holds 4 box rows plus at least one class, so
    /// it must be >= 5. When both trailing dims qualify the smaller one is
    /// taken as attributes (anchor counts dwarf attribute counts in every
    /// supported family); equal dims resolve to box-rows-first.
    pub fn probe(dims: &[usize]) -> Result<Self> {
        if dims.len() != 3 || dims[0] != 1 {
            bail!("unrecognized output shape {dims:?}, expected [1, attrs, anchors]");
        }
        let (a, b) = (dims[1], dims[2]);
        let attrs_is_first = if a.min(b) >= 5 {
            a <= b
        } else if a >= 5 {
            true
        } else if b >= 5 {
            false
        } else {
            bail!("output shape {dims:?} has no attribute dimension >= 5 (4 box rows + classes)");
        };
        Ok(if attrs_is_first {
            OutputLayout::AttrsFirst {
                num_classes: a - 4,
                num_anchors: b,
            }
        } else {
            OutputLayout::AnchorsFirst {
                num_classes: b - 4,
                num_anchors: a,
            }
        })
    }

    pub fn num_classes(&self) -> usize {
        match *self {
            OutputLayout::AttrsFirst { num_classes, .. }
            | OutputLayout::AnchorsFirst { num_classes, .. } => num_classes,
        }
    }

    pub fn num_anchors(&self) -> usize {
        match *self {
            OutputLayout::AttrsFirst { num_anchors, .. }
            | OutputLayout::AnchorsFirst { num_anchors, .. } => num_anchors,
        }
    }

    pub fn element_count(&self) -> usize {
        (self.num_classes() + 4) * self.num_anchors()
    }

    /// Flat index of attribute row `attr` at anchor `i`.
    #[inline]
    fn at(&self, attr: usize, i: usize) -> usize {
        match *self {
            OutputLayout::AttrsFirst { num_anchors, .. } => attr * num_anchors + i,
            OutputLayout::AnchorsFirst { num_classes, .. } => i * (num_classes + 4) + attr,
        }
    }
}

/// Whether class scores arrive as probabilities or raw logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    /// Already activated, read as-is.
    Probability,
    /// Sigmoid applied before thresholding.
    Logits,
}

/// 后处理产出的候选框 (detect调用内短命, 像素坐标)
#[derive(Debug, Clone)]
pub struct Candidate {
    pub class_id: u32,
    pub score: f32,
    pub bbox: Bbox,
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 后处理: 原始输出 → 候选框
///
/// 每个anchor在类别维上取argmax (前4行是框几何, 不参与评分); 仅当
/// 最高分严格大于 `conf_threshold` 且类别在允许表内时产出候选。
/// 空允许表意为接受全部类别。最高分 <= 0 的anchor视为背景被丢弃,
/// 绝不回落到类别0。中心式框按轴乘缩放系数还原为源帧像素角点式。
pub fn decode_output(
    data: &[f32],
    layout: OutputLayout,
    scales: ScaleFactors,
    conf_threshold: f32,
    allowed_classes: &[u32],
    score_mode: ScoreMode,
) -> Vec<Candidate> {
    let num_classes = layout.num_classes();
    let num_anchors = layout.num_anchors();
    if data.len() < layout.element_count() {
        tracing::warn!(
            expected = layout.element_count(),
            actual = data.len(),
            "output tensor shorter than probed layout, dropping frame"
        );
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for i in 0..num_anchors {
        let mut best: Option<(u32, f32)> = None;
        for c in 0..num_classes {
            let mut score = data[layout.at(4 + c, i)];
            if score_mode == ScoreMode::Logits {
                score = sigmoid(score);
            }
            // strict >: a masked anchor (all scores <= 0) selects no class
            if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((c as u32, score));
            }
        }
        let Some((class_id, score)) = best else {
            continue;
        };
        if score <= conf_threshold {
            continue;
        }
        if !allowed_classes.is_empty() && !allowed_classes.contains(&class_id) {
            continue;
        }

        let cx = data[layout.at(0, i)];
        let cy = data[layout.at(1, i)];
        let w = data[layout.at(2, i)];
        let h = data[layout.at(3, i)];
        let bbox = Bbox::new(
            (cx - 0.5 * w) * scales.x,
            (cy - 0.5 * h) * scales.y,
            w * scales.x,
            h * scales.y,
        );
        candidates.push(Candidate {
            class_id,
            score,
            bbox,
        });
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs_first(num_classes: usize, num_anchors: usize) -> OutputLayout {
        OutputLayout::AttrsFirst {
            num_classes,
            num_anchors,
        }
    }

    const UNIT: ScaleFactors = ScaleFactors { x: 1.0, y: 1.0 };

    /// Build a [1, 4+nc, anchors] buffer from per-anchor (box, scores) rows.
    fn synth_output(nc: usize, anchors: &[([f32; 4], Vec<f32>)]) -> Vec<f32> {
        let n = anchors.len();
        let mut data = vec![0.0; (4 + nc) * n];
        for (i, (bx, scores)) in anchors.iter().enumerate() {
            for (a, v) in bx.iter().enumerate() {
                data[a * n + i] = *v;
            }
            for (c, v) in scores.iter().enumerate() {
                data[(4 + c) * n + i] = *v;
            }
        }
        data
    }

    #[test]
    fn test_preprocess_chw_layout_and_normalization() {
        // 2x2 RGB frame with one red, one green, one blue, one white pixel
        let mut img = image::RgbImage::new(2, 2);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        img.put_pixel(1, 0, image::Rgb([0, 255, 0]));
        img.put_pixel(0, 1, image::Rgb([0, 0, 255]));
        img.put_pixel(1, 1, image::Rgb([255, 255, 255]));
        let frame = DynamicImage::ImageRgb8(img);

        let (tensor, scales) = preprocess(&frame, 2, 2, InputPrecision::F32);
        assert_eq!(scales, ScaleFactors { x: 1.0, y: 1.0 });
        let InputTensor::F32(t) = tensor else {
            panic!("expected f32 tensor");
        };
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        // red pixel: R plane 1.0, G/B planes 0.0
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert_eq!(t[[0, 1, 0, 0]], 0.0);
        assert_eq!(t[[0, 2, 0, 0]], 0.0);
        // green pixel at (x=1, y=0)
        assert_eq!(t[[0, 1, 0, 1]], 1.0);
        // blue pixel at (x=0, y=1)
        assert_eq!(t[[0, 2, 1, 0]], 1.0);
        // white pixel normalized to 1.0 in every plane
        assert_eq!(t[[0, 0, 1, 1]], 1.0);
        assert_eq!(t[[0, 1, 1, 1]], 1.0);
        assert_eq!(t[[0, 2, 1, 1]], 1.0);
    }

    #[test]
    fn test_preprocess_drops_alpha() {
        let mut img = image::RgbaImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgba([255, 128, 0, 7]));
        let frame = DynamicImage::ImageRgba8(img);
        let (tensor, _) = preprocess(&frame, 1, 1, InputPrecision::F32);
        let InputTensor::F32(t) = tensor else {
            panic!("expected f32 tensor");
        };
        assert_eq!(t.shape(), &[1, 3, 1, 1]);
        assert_eq!(t[[0, 0, 0, 0]], 1.0);
        assert!((t[[0, 1, 0, 0]] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_f16_is_value_preserving() {
        let mut img = image::RgbImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgb([255, 0, 255]));
        let frame = DynamicImage::ImageRgb8(img);
        let (tensor, _) = preprocess(&frame, 1, 1, InputPrecision::F16);
        let InputTensor::F16(t) = tensor else {
            panic!("expected f16 tensor");
        };
        // 1.0 and 0.0 are exactly representable in half precision
        assert_eq!(t[[0, 0, 0, 0]].to_f32(), 1.0);
        assert_eq!(t[[0, 1, 0, 0]].to_f32(), 0.0);
    }

    #[test]
    fn test_scale_factors_round_trip() {
        // 1920x1080 frame against a 640x640 working resolution
        let scales = ScaleFactors::new(1920, 1080, 640, 640);
        let (cx, cy, w, h) = (320.0f32, 240.0, 100.0, 64.0);

        let left = (cx - 0.5 * w) * scales.x;
        let top = (cy - 0.5 * h) * scales.y;
        let width = w * scales.x;
        let height = h * scales.y;

        // invert back into the working resolution
        let rcx = (left + width / 2.0) / scales.x;
        let rcy = (top + height / 2.0) / scales.y;
        let rw = width / scales.x;
        let rh = height / scales.y;
        assert!((rcx - cx).abs() < 1e-3);
        assert!((rcy - cy).abs() < 1e-3);
        assert!((rw - w).abs() < 1e-3);
        assert!((rh - h).abs() < 1e-3);
    }

    #[test]
    fn test_probe_yolov8_default_layout() {
        let layout = OutputLayout::probe(&[1, 84, 8400]).unwrap();
        assert_eq!(
            layout,
            OutputLayout::AttrsFirst {
                num_classes: 80,
                num_anchors: 8400
            }
        );
    }

    #[test]
    fn test_probe_transposed_layout() {
        let layout = OutputLayout::probe(&[1, 8400, 84]).unwrap();
        assert_eq!(
            layout,
            OutputLayout::AnchorsFirst {
                num_classes: 80,
                num_anchors: 8400
            }
        );
    }

    #[test]
    fn test_probe_small_synthetic_layout() {
        // more attribute rows than anchors: still box-rows-first
        let layout = OutputLayout::probe(&[1, 6, 3]).unwrap();
        assert_eq!(
            layout,
            OutputLayout::AttrsFirst {
                num_classes: 2,
                num_anchors: 3
            }
        );
    }

    #[test]
    fn test_probe_rejects_unrecognized_shapes() {
        assert!(OutputLayout::probe(&[84, 8400]).is_err());
        assert!(OutputLayout::probe(&[2, 84, 8400]).is_err());
        assert!(OutputLayout::probe(&[1, 4, 3]).is_err());
    }

    #[test]
    fn test_decode_end_to_end_scenario() {
        // [1, 6, 3]: 2 classes, 3 anchors; anchor 1 carries class 1 at 0.9
        // with a center-form box (320, 320, 100, 100) in a 640x640 working
        // space applied to a 640x640 source frame
        let data = synth_output(
            2,
            &[
                ([0.0; 4], vec![0.0, 0.0]),
                ([320.0, 320.0, 100.0, 100.0], vec![0.1, 0.9]),
                ([0.0; 4], vec![0.0, 0.0]),
            ],
        );
        let layout = OutputLayout::probe(&[1, 6, 3]).unwrap();
        let scales = ScaleFactors::new(640, 640, 640, 640);
        let candidates = decode_output(&data, layout, scales, 0.5, &[], ScoreMode::Probability);

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.class_id, 1);
        assert!((c.score - 0.9).abs() < 1e-6);
        assert!((c.bbox.xmin() - 270.0).abs() < 1e-3);
        assert!((c.bbox.ymin() - 270.0).abs() < 1e-3);
        assert!((c.bbox.width() - 100.0).abs() < 1e-3);
        assert!((c.bbox.height() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_confidence_boundary_is_strict() {
        let layout = attrs_first(2, 1);
        let exactly = synth_output(2, &[([10.0, 10.0, 4.0, 4.0], vec![0.0, 0.5])]);
        let above = synth_output(2, &[([10.0, 10.0, 4.0, 4.0], vec![0.0, 0.5 + 1e-4])]);

        let rejected = decode_output(&exactly, layout, UNIT, 0.5, &[], ScoreMode::Probability);
        assert!(rejected.is_empty());

        let accepted = decode_output(&above, layout, UNIT, 0.5, &[], ScoreMode::Probability);
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn test_decode_allow_list_semantics() {
        // three anchors carrying classes 0, 1, 2 at high confidence
        let data = synth_output(
            3,
            &[
                ([10.0, 10.0, 4.0, 4.0], vec![0.9, 0.0, 0.0]),
                ([30.0, 10.0, 4.0, 4.0], vec![0.0, 0.9, 0.0]),
                ([50.0, 10.0, 4.0, 4.0], vec![0.0, 0.0, 0.9]),
            ],
        );
        let layout = attrs_first(3, 3);

        // empty allow-list accepts all classes
        let all = decode_output(&data, layout, UNIT, 0.5, &[], ScoreMode::Probability);
        assert_eq!(all.len(), 3);

        // {0, 2} rejects class 1 regardless of confidence
        let some = decode_output(&data, layout, UNIT, 0.5, &[0, 2], ScoreMode::Probability);
        let classes: Vec<u32> = some.iter().map(|c| c.class_id).collect();
        assert_eq!(classes, vec![0, 2]);
    }

    #[test]
    fn test_decode_masked_anchor_selects_no_class() {
        // every score <= 0: the anchor is background, never class 0
        let data = synth_output(2, &[([10.0, 10.0, 4.0, 4.0], vec![0.0, -1.0])]);
        let layout = attrs_first(2, 1);
        let out = decode_output(&data, layout, UNIT, -1.0, &[], ScoreMode::Probability);
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_logit_scores_pass_through_sigmoid() {
        // logit 2.0 -> ~0.88, logit -2.0 -> ~0.12
        let data = synth_output(2, &[([10.0, 10.0, 4.0, 4.0], vec![-2.0, 2.0])]);
        let layout = attrs_first(2, 1);
        let out = decode_output(&data, layout, UNIT, 0.5, &[], ScoreMode::Logits);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].score - 0.8808).abs() < 1e-3);
    }

    #[test]
    fn test_decode_transposed_layout_reads_same_values() {
        // same single anchor expressed in [1, anchors, 4+nc] order
        let layout = OutputLayout::AnchorsFirst {
            num_classes: 2,
            num_anchors: 1,
        };
        let data = vec![20.0, 20.0, 8.0, 8.0, 0.1, 0.8];
        let out = decode_output(&data, layout, UNIT, 0.5, &[], ScoreMode::Probability);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].bbox.xmin() - 16.0).abs() < 1e-6);
    }
}

pub mod annotate; // 检测框标注合成
pub mod channel; // 结果通道 (检测结果 + 性能指标)
pub mod config; // 运行配置
pub mod engines; // 推理引擎抽象与实现
pub mod filters; // 图像滤镜
pub mod labels; // COCO类别标签
pub mod pipeline; // 帧处理流水线
pub mod registry; // 引擎注册表与生命周期
pub mod tensor; // 张量预处理/后处理

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

pub use crate::channel::{MetricsBuffer, PerfMetrics, ResultChannel};
pub use crate::config::{Args, EngineConfig, ProcessingMode};
pub use crate::engines::{Backend, EngineKind, InferenceEngine};
pub use crate::filters::FilterKind;
pub use crate::registry::{EngineRegistry, EngineState};
pub use crate::tensor::{InputPrecision, OutputLayout, ScaleFactors};

/// Coordinate frame a detection box is expressed in.
///
/// The legacy host contract consumes pixel-space boxes; the later contract
/// consumes unit-normalized boxes. Tracking the space on every value keeps
/// the two from being mixed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordSpace {
    Pixel,
    Normalized,
}

/// 检测框 (corner-form: left/top/width/height)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
        }
    }

    /// Center-form constructor (cx, cy, w, h).
    pub fn from_cxcywh(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            xmin: cx - width / 2.,
            ymin: cy - height / 2.,
            width,
            height,
        }
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn cx(&self) -> f32 {
        self.xmin + self.width / 2.
    }

    pub fn cy(&self) -> f32 {
        self.ymin + self.height / 2.
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// IoU is zero for disjoint boxes.
    pub fn iou(&self, another: &Bbox) -> f32 {
        let inter = self.intersection_area(another);
        if inter <= 0. {
            return 0.;
        }
        inter / (self.area() + another.area() - inter)
    }
}

// 序列化为 [x, y, w, h] (宿主UI消费的JSON格式)
impl Serialize for Bbox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.xmin)?;
        seq.serialize_element(&self.ymin)?;
        seq.serialize_element(&self.width)?;
        seq.serialize_element(&self.height)?;
        seq.end()
    }
}

/// 最终检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    #[serde(rename = "class")]
    pub class_id: u32,
    #[serde(rename = "conf")]
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: Bbox,
    #[serde(skip)]
    pub space: CoordSpace,
}

impl Detection {
    /// Convert a pixel-space detection into the normalized contract.
    /// Already-normalized values pass through unchanged.
    pub fn to_normalized(mut self, frame_width: u32, frame_height: u32) -> Self {
        if self.space == CoordSpace::Normalized || frame_width == 0 || frame_height == 0 {
            return self;
        }
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        self.bbox = Bbox::new(
            self.bbox.xmin / fw,
            self.bbox.ymin / fh,
            self.bbox.width / fw,
            self.bbox.height / fh,
        );
        self.space = CoordSpace::Normalized;
        self
    }
}

/// Greedy non-maximum suppression over parallel box/score slices.
///
/// Boxes scoring <= `score_threshold` are discarded before comparison.
/// Remaining candidates are visited in descending-score order (stable sort,
/// so equal scores keep insertion order); a candidate is dropped when its
/// IoU with an already-accepted box is strictly greater than
/// `iou_threshold`. Returned indices are in acceptance order.
pub fn nms_indices(
    boxes: &[Bbox],
    scores: &[f32],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<usize> {
    let n = boxes.len().min(scores.len());
    let mut order: Vec<usize> = (0..n).filter(|&i| scores[i] > score_threshold).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::with_capacity(order.len());
    for &index in &order {
        let mut drop = false;
        for &prev in &keep {
            if boxes[prev].iou(&boxes[index]) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            keep.push(index);
        }
    }
    keep
}

pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}

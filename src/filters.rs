//! 图像滤镜 (Cosmetic filters)
//!
//! 独立的逐帧无状态变换, 按名字从配置面选择, "none" 哨兵为直通。
//! 唯一的跨调用状态是舞台滤镜按帧尺寸记忆的径向遮罩, 由滤镜持有者
//! 自己携带, 尺寸不匹配时失效重建, 不是可变全局量。

use image::RgbaImage;

/// 滤镜种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    /// 直通
    #[default]
    None,
    Gray,
    Blur,
    HistEq,
    Binary,
    Stage,
}

impl FilterKind {
    /// "none" is the documented passthrough sentinel; unknown names also
    /// resolve to passthrough.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "gray" | "grayscale" => FilterKind::Gray,
            "blur" => FilterKind::Blur,
            "histeq" => FilterKind::HistEq,
            "binary" => FilterKind::Binary,
            "stage" => FilterKind::Stage,
            _ => FilterKind::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::Gray => "gray",
            FilterKind::Blur => "blur",
            FilterKind::HistEq => "histeq",
            FilterKind::Binary => "binary",
            FilterKind::Stage => "stage",
        }
    }
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// 按尺寸记忆的舞台聚光遮罩
struct StageMask {
    width: u32,
    height: u32,
    /// per-pixel weights, 0..=255
    weights: Vec<u8>,
}

impl StageMask {
    fn build(width: u32, height: u32) -> Self {
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let radius = (width.min(height) as f32) / 2.0;
        // soft edge between 0.75r and 1.25r approximates the blurred circle
        let (inner, outer) = (radius * 0.75, radius * 1.25);
        let mut weights = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                let t = ((outer - d) / (outer - inner)).clamp(0.0, 1.0);
                // smoothstep
                let w = t * t * (3.0 - 2.0 * t);
                weights.push((w * 255.0) as u8);
            }
        }
        Self {
            width,
            height,
            weights,
        }
    }
}

/// 滤镜执行器, 携带舞台遮罩缓存
#[derive(Default)]
pub struct FilterEngine {
    stage_mask: Option<StageMask>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 就地应用滤镜; `FilterKind::None` 为直通。
    pub fn apply(&mut self, kind: FilterKind, image: &mut RgbaImage) {
        if image.width() == 0 || image.height() == 0 {
            return;
        }
        match kind {
            FilterKind::None => {}
            FilterKind::Gray => Self::gray(image),
            FilterKind::Blur => Self::blur(image),
            FilterKind::HistEq => Self::hist_eq(image),
            FilterKind::Binary => Self::binary(image),
            FilterKind::Stage => self.stage(image),
        }
    }

    fn gray(image: &mut RgbaImage) {
        for pixel in image.pixels_mut() {
            let [r, g, b, a] = pixel.0;
            let l = luma(r, g, b).round().min(255.0) as u8;
            pixel.0 = [l, l, l, a];
        }
    }

    fn blur(image: &mut RgbaImage) {
        *image = image::imageops::blur(image, 4.0);
    }

    /// Luma histogram equalization; chroma follows the luma gain.
    fn hist_eq(image: &mut RgbaImage) {
        let total = (image.width() * image.height()) as u32;
        if total == 0 {
            return;
        }
        let mut histogram = [0u32; 256];
        for pixel in image.pixels() {
            let [r, g, b, _] = pixel.0;
            histogram[luma(r, g, b).round().min(255.0) as usize] += 1;
        }
        let mut cdf = [0u32; 256];
        let mut acc = 0u32;
        for (i, count) in histogram.iter().enumerate() {
            acc += count;
            cdf[i] = acc;
        }
        let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
        let denom = (total - cdf_min).max(1);

        for pixel in image.pixels_mut() {
            let [r, g, b, a] = pixel.0;
            let l = luma(r, g, b).round().min(255.0).max(1.0);
            let equalized =
                ((cdf[l as usize].saturating_sub(cdf_min)) as f32 / denom as f32) * 255.0;
            let gain = equalized / l;
            pixel.0 = [
                (r as f32 * gain).min(255.0) as u8,
                (g as f32 * gain).min(255.0) as u8,
                (b as f32 * gain).min(255.0) as u8,
                a,
            ];
        }
    }

    fn binary(image: &mut RgbaImage) {
        for pixel in image.pixels_mut() {
            let [r, g, b, a] = pixel.0;
            let v = if luma(r, g, b) > 128.0 { 255 } else { 0 };
            pixel.0 = [v, v, v, a];
        }
    }

    fn stage(&mut self, image: &mut RgbaImage) {
        let (w, h) = (image.width(), image.height());
        // mask recomputed only when the frame dimensions change
        let rebuild = !matches!(
            self.stage_mask,
            Some(ref m) if m.width == w && m.height == h
        );
        if rebuild {
            self.stage_mask = Some(StageMask::build(w, h));
        }
        let Some(mask) = self.stage_mask.as_ref() else {
            return;
        };

        for (i, pixel) in image.pixels_mut().enumerate() {
            let weight = mask.weights[i] as u16;
            let [r, g, b, a] = pixel.0;
            pixel.0 = [
                ((r as u16 * weight) / 255) as u8,
                ((g as u16 * weight) / 255) as u8,
                ((b as u16 * weight) / 255) as u8,
                a,
            ];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba(rgba))
    }

    #[test]
    fn test_filter_names() {
        assert_eq!(FilterKind::from_name("none"), FilterKind::None);
        assert_eq!(FilterKind::from_name("Gray"), FilterKind::Gray);
        assert_eq!(FilterKind::from_name("stage"), FilterKind::Stage);
        // unknown names resolve to passthrough
        assert_eq!(FilterKind::from_name("sepia"), FilterKind::None);
    }

    #[test]
    fn test_passthrough_leaves_pixels_untouched() {
        let mut image = solid(4, 4, [10, 20, 30, 255]);
        let expected = image.clone();
        FilterEngine::new().apply(FilterKind::None, &mut image);
        assert_eq!(image, expected);
    }

    #[test]
    fn test_gray_equalizes_channels() {
        let mut image = solid(2, 2, [200, 100, 50, 255]);
        FilterEngine::new().apply(FilterKind::Gray, &mut image);
        let p = image.get_pixel(0, 0).0;
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
        assert_eq!(p[3], 255);
    }

    #[test]
    fn test_binary_thresholds_at_128() {
        let mut dark = solid(1, 1, [100, 100, 100, 255]);
        FilterEngine::new().apply(FilterKind::Binary, &mut dark);
        assert_eq!(dark.get_pixel(0, 0).0, [0, 0, 0, 255]);

        let mut bright = solid(1, 1, [200, 200, 200, 255]);
        FilterEngine::new().apply(FilterKind::Binary, &mut bright);
        assert_eq!(bright.get_pixel(0, 0).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_stage_darkens_corners_keeps_center() {
        let mut image = solid(64, 64, [200, 200, 200, 255]);
        FilterEngine::new().apply(FilterKind::Stage, &mut image);
        let center = image.get_pixel(32, 32).0;
        let corner = image.get_pixel(0, 0).0;
        assert_eq!(center[0], 200);
        assert!(corner[0] < 50);
        assert_eq!(corner[3], 255); // alpha untouched
    }

    #[test]
    fn test_stage_mask_memoized_by_dimensions() {
        let mut engine = FilterEngine::new();
        let mut a = solid(32, 32, [128, 128, 128, 255]);
        engine.apply(FilterKind::Stage, &mut a);
        let first = engine.stage_mask.as_ref().unwrap().weights.as_ptr();

        let mut b = solid(32, 32, [10, 10, 10, 255]);
        engine.apply(FilterKind::Stage, &mut b);
        // same dimensions: the cached mask is reused, not rebuilt
        assert_eq!(engine.stage_mask.as_ref().unwrap().weights.as_ptr(), first);

        let mut c = solid(16, 16, [10, 10, 10, 255]);
        engine.apply(FilterKind::Stage, &mut c);
        let m = engine.stage_mask.as_ref().unwrap();
        assert_eq!((m.width, m.height), (16, 16));
    }
}

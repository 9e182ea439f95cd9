//! 检测结果标注合成 (composite)
//!
//! 把检测框与标签直接绘制到RGBA帧上。归一化坐标在绘制前换算回像素。
//! 文字需要调用方提供字体; 不带字体时只画框。

use ab_glyph::{FontRef, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::{CoordSpace, Detection};

const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const LABEL_HEIGHT: u32 = 16;

fn pixel_rect(det: &Detection, width: u32, height: u32) -> Option<(i32, i32, u32, u32)> {
    let (mut x, mut y, mut w, mut h) = (
        det.bbox.xmin(),
        det.bbox.ymin(),
        det.bbox.width(),
        det.bbox.height(),
    );
    if det.space == CoordSpace::Normalized {
        x *= width as f32;
        w *= width as f32;
        y *= height as f32;
        h *= height as f32;
    }
    let w = w.round().max(0.0) as u32;
    let h = h.round().max(0.0) as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some((x.round() as i32, y.round() as i32, w, h))
}

/// 画检测框 (2px边框)
pub fn draw_detections(image: &mut RgbaImage, detections: &[Detection]) {
    let (width, height) = (image.width(), image.height());
    for det in detections {
        let Some((x, y, w, h)) = pixel_rect(det, width, height) else {
            continue;
        };
        draw_hollow_rect_mut(image, Rect::at(x, y).of_size(w, h), BOX_COLOR);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                image,
                Rect::at(x + 1, y + 1).of_size(w - 2, h - 2),
                BOX_COLOR,
            );
        }
    }
}

/// 画检测框 + `label NN%` 标签条
pub fn draw_detections_labeled(image: &mut RgbaImage, detections: &[Detection], font: &FontRef) {
    draw_detections(image, detections);
    let (width, height) = (image.width(), image.height());
    let scale = PxScale::from(LABEL_HEIGHT as f32 - 2.0);
    for det in detections {
        let Some((x, y, w, _)) = pixel_rect(det, width, height) else {
            continue;
        };
        let text = format!("{} {}%", det.label, (det.confidence * 100.0) as u32);
        let bar_y = (y - LABEL_HEIGHT as i32).max(0);
        // rough glyph advance, enough to back the text
        let bar_w = (text.len() as u32 * LABEL_HEIGHT / 2).max(w).max(1);
        draw_filled_rect_mut(image, Rect::at(x, bar_y).of_size(bar_w, LABEL_HEIGHT), BOX_COLOR);
        draw_text_mut(image, TEXT_COLOR, x + 2, bar_y + 1, scale, font, &text);
    }
}

// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{DetectItem, DetectResult, LabelMap};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_TEXT_HORIZONTAL_PADDING: i32 = 4;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 20;

/// 未指定字体时依次尝试的系统字体
const FONT_SEARCH_PATHS: [&str; 6] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "/Library/Fonts/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  InvalidFont(String),
}

pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl Draw {
  pub fn new(font: Option<FontArc>) -> Self {
    // 色相均匀分布的调色板，按类别编号取色
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();

    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      colors,
    }
  }

  /// 指定字体文件时必须能加载；否则在常见系统位置查找，找不到就只画边框
  pub fn load(font_path: Option<&Path>) -> Result<Self, DrawError> {
    if let Some(path) = font_path {
      info!("加载字体文件: {}", path.display());
      return Ok(Self::new(Some(load_font(path)?)));
    }

    for candidate in FONT_SEARCH_PATHS.iter().map(Path::new) {
      if !candidate.exists() {
        continue;
      }
      match load_font(candidate) {
        Ok(font) => {
          info!("使用系统字体: {}", candidate.display());
          return Ok(Self::new(Some(font)));
        }
        Err(e) => warn!("跳过字体 {}: {}", candidate.display(), e),
      }
    }

    warn!("未找到可用字体，标注图只绘制边框，不绘制标签文字");
    Ok(Self::new(None))
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_for(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  pub fn draw_detections_on_image(
    &self,
    image: &mut RgbImage,
    result: &DetectResult,
    labels: &LabelMap,
  ) {
    for DetectItem {
      class_id,
      score,
      bbox,
    } in result.items.iter()
    {
      let label = format!("{} {:.2}", labels.label(*class_id), score);
      self.draw_bbox_with_label(image, bbox, &label, self.color_for(*class_id));
    }
  }

  // bbox 为归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32; 4], label: &str, color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    let (w, h) = (image.width() as f32, image.height() as f32);

    let x_min = ((bbox[0] * w).floor() as i32).clamp(0, w as i32 - 1);
    let y_min = ((bbox[1] * h).floor() as i32).clamp(0, h as i32 - 1);
    let x_max = ((bbox[2] * w).ceil() as i32).clamp(0, w as i32 - 1);
    let y_max = ((bbox[3] * h).ceil() as i32).clamp(0, h as i32 - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框向内加粗
    for thickness in 0..BOX_THICKNESS {
      let left = (x_min + thickness).min(x_max);
      let top = (y_min + thickness).min(y_max);
      let right = (x_max - thickness).max(left);
      let bottom = (y_max - thickness).max(top);

      for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
      }
      for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
      }
    }

    let Some(font) = &self.font else {
      return;
    };

    let scale = PxScale::from(self.font_size);
    let (text_width, _) = text_size(scale, font, label);
    let text_width = text_width as i32 + 2 * LABEL_TEXT_HORIZONTAL_PADDING;

    // 标签放在边框上方，空间不够时贴着图像顶部
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(w as i32 - label_x);

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width as u32, self.label_text_height as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x + LABEL_TEXT_HORIZONTAL_PADDING,
        label_y + LABEL_TEXT_VERTICAL_PADDING,
        scale,
        font,
        label,
      );
    }
  }
}

fn load_font(path: &Path) -> Result<FontArc, DrawError> {
  let data = std::fs::read(path)?;
  FontArc::try_from_vec(data).map_err(|e| DrawError::InvalidFont(format!("{}: {}", path.display(), e)))
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gray(w: u32, h: u32) -> RgbImage {
    RgbImage::from_pixel(w, h, Rgb([128, 128, 128]))
  }

  #[test]
  fn empty_result_leaves_image_untouched() {
    let draw = Draw::new(None);
    let original = gray(32, 24);
    let mut image = original.clone();
    draw.draw_detections_on_image(&mut image, &DetectResult::default(), &LabelMap::default());
    assert_eq!(image, original);
  }

  #[test]
  fn draws_box_outline_in_class_color() {
    let draw = Draw::new(None);
    let mut image = gray(100, 100);
    let result = DetectResult::from(vec![DetectItem {
      class_id: 3,
      score: 0.9,
      bbox: [0.1, 0.2, 0.5, 0.6],
    }]);
    draw.draw_detections_on_image(&mut image, &result, &LabelMap::default());

    let color = draw.color_for(3);
    assert_eq!(*image.get_pixel(10, 20), color);
    assert_eq!(*image.get_pixel(11, 21), color);
    assert_eq!(*image.get_pixel(50, 60), color);
    assert_eq!(*image.get_pixel(30, 40), Rgb([128, 128, 128]));
  }

  #[test]
  fn degenerate_boxes_are_skipped() {
    let draw = Draw::new(None);
    let original = gray(10, 10);
    let mut image = original.clone();
    let result = DetectResult::from(vec![DetectItem {
      class_id: 0,
      score: 0.5,
      bbox: [0.5, 0.5, 0.5, 0.5],
    }]);
    draw.draw_detections_on_image(&mut image, &result, &LabelMap::default());
    assert_eq!(image, original);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    assert!(Draw::load(Some(Path::new("/nonexistent/font.ttf"))).is_err());
  }

  #[test]
  fn palette_wraps_around() {
    let draw = Draw::new(None);
    assert_eq!(draw.color_for(0), draw.color_for(PALETTE_SIZE as u32));
    assert_ne!(draw.color_for(0), draw.color_for(1));
  }
}

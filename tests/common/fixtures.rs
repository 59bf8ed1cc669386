// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// tests/common/fixtures.rs - 测试图片与检测结果
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

use std::io::Cursor;

use fabric_defect::batch::UploadedImage;
use fabric_defect::model::{DetectItem, DetectResult, LabelMap};
use image::{ImageFormat, Rgb, RgbImage};

pub fn fabric_labels() -> LabelMap {
  [(0, "hole"), (1, "stain"), (2, "thread")].into_iter().collect()
}

/// 带纹理的布料图，避免纯色图片掩盖绘制错误
pub fn cloth(width: u32, height: u32) -> RgbImage {
  RgbImage::from_fn(width, height, |x, y| {
    let v = if (x / 4 + y / 4) % 2 == 0 { 180 } else { 150 };
    Rgb([v, v - 20, v - 40])
  })
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
  let mut buffer = Cursor::new(Vec::new());
  image
    .write_to(&mut buffer, ImageFormat::Png)
    .expect("Failed to encode test image");
  buffer.into_inner()
}

pub fn cloth_upload(name: &str) -> UploadedImage {
  UploadedImage::new(name, png_bytes(&cloth(64, 48)))
}

pub fn detection(class_id: u32, score: f32) -> DetectResult {
  DetectResult::from(vec![DetectItem {
    class_id,
    score,
    bbox: [0.25, 0.25, 0.75, 0.75],
  }])
}

pub fn detections(items: &[(u32, f32)]) -> DetectResult {
  DetectResult::from(
    items
      .iter()
      .enumerate()
      .map(|(i, &(class_id, score))| {
        let offset = i as f32 * 0.1;
        DetectItem {
          class_id,
          score,
          bbox: [0.05 + offset, 0.05, 0.3 + offset, 0.4],
        }
      })
      .collect::<Vec<_>>(),
  )
}

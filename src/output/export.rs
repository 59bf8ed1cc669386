// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/output/export.rs - 标注图 PNG 导出
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
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::info;

use crate::{
  model::DetectResult,
  output::{Annotator, Render},
  workflow::ImageReport,
};

#[derive(Error, Debug)]
pub enum ExportError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像编码错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 可供下载的标注图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedImage {
  pub index: usize,
  pub file_name: String,
  pub png: Vec<u8>,
}

impl AnnotatedImage {
  /// 写入目录，返回完整路径
  pub fn save(&self, directory: &Path) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(directory)?;
    let path = directory.join(&self.file_name);
    std::fs::write(&path, &self.png)?;
    info!("保存标注图到文件: {}", path.display());
    Ok(path)
  }
}

/// `prediction_<序号>_<原文件名>.png`，序号从 1 开始
pub fn prediction_file_name(index: usize, original_name: &str) -> String {
  format!("prediction_{}_{}.png", index, original_name)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, ExportError> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Png)?;
  Ok(buffer.into_inner())
}

/// 标注后编码为 PNG
#[derive(Clone, Copy)]
pub struct PngExport<'a> {
  annotator: Annotator<'a>,
}

impl<'a> PngExport<'a> {
  pub fn new(annotator: Annotator<'a>) -> Self {
    Self { annotator }
  }

  pub fn export_report(&self, report: &ImageReport) -> Result<AnnotatedImage, ExportError> {
    let png = self.render_result(&report.image, &report.result)?;
    Ok(AnnotatedImage {
      index: report.index,
      file_name: prediction_file_name(report.index, &report.name),
      png,
    })
  }
}

impl Render<RgbImage, DetectResult> for PngExport<'_> {
  type Rendered = Vec<u8>;
  type Error = ExportError;

  fn render_result(&self, frame: &RgbImage, result: &DetectResult) -> Result<Vec<u8>, ExportError> {
    let Ok(annotated) = self.annotator.render_result(frame, result);
    encode_png(&annotated)
  }
}

// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/workflow.rs - 检测工作流
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

use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  batch::{UploadBatch, UploadedImage},
  model::{DetectResult, Detector, DetectorError, InferenceParameters},
  report::{AggregateTable, Detection, extract_detections},
};

#[derive(Error, Debug)]
pub enum ImageError {
  #[error("无法解码图片: {0}")]
  DecodeError(#[from] image::ImageError),
  #[error("检测失败: {0}")]
  DetectError(#[from] DetectorError),
}

/// 单张图片的检测结果，标注图由渲染步骤生成
#[derive(Debug, Clone)]
pub struct ImageReport {
  /// 批次中的序号，从 1 开始
  pub index: usize,
  pub name: String,
  pub image: RgbImage,
  pub result: DetectResult,
  pub detections: Vec<Detection>,
  pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
  pub index: usize,
  pub name: String,
  pub reason: String,
}

#[derive(Debug, Clone)]
pub enum ImageOutcome {
  Processed(ImageReport),
  Failed(ImageFailure),
}

impl ImageOutcome {
  pub fn index(&self) -> usize {
    match self {
      ImageOutcome::Processed(report) => report.index,
      ImageOutcome::Failed(failure) => failure.index,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      ImageOutcome::Processed(report) => &report.name,
      ImageOutcome::Failed(failure) => &failure.name,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  /// 没有上传图片，未执行推理
  NoImages,
  /// 全部图片都没有检测到瑕疵
  NoDefects,
  Detections,
  /// 部分图片处理失败，其余图片没有检测到瑕疵
  Partial,
  /// 所有图片都处理失败
  Failed,
}

impl RunStatus {
  /// 页面上展示给用户的提示
  pub fn message(self) -> &'static str {
    match self {
      RunStatus::NoImages => "Upload up to 5 images, then run detection.",
      RunStatus::NoDefects => "No defects detected in all uploaded images.",
      RunStatus::Detections => "All detections are listed below, sorted by probability.",
      RunStatus::Partial => {
        "No defects detected in the processed images; some images could not be processed."
      }
      RunStatus::Failed => "None of the uploaded images could be processed.",
    }
  }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
  pub parameters: InferenceParameters,
  pub outcomes: Vec<ImageOutcome>,
  pub table: AggregateTable,
}

impl BatchOutcome {
  pub fn status(&self) -> RunStatus {
    if self.outcomes.is_empty() {
      RunStatus::NoImages
    } else if !self.table.is_empty() {
      RunStatus::Detections
    } else if self.processed().next().is_none() {
      RunStatus::Failed
    } else if self.failures().next().is_some() {
      RunStatus::Partial
    } else {
      RunStatus::NoDefects
    }
  }

  pub fn processed(&self) -> impl Iterator<Item = &ImageReport> {
    self.outcomes.iter().filter_map(|outcome| match outcome {
      ImageOutcome::Processed(report) => Some(report),
      ImageOutcome::Failed(_) => None,
    })
  }

  pub fn failures(&self) -> impl Iterator<Item = &ImageFailure> {
    self.outcomes.iter().filter_map(|outcome| match outcome {
      ImageOutcome::Failed(failure) => Some(failure),
      ImageOutcome::Processed(_) => None,
    })
  }

  /// 按 1 开始的序号取成功处理的图片
  pub fn report(&self, index: usize) -> Option<&ImageReport> {
    self.processed().find(|report| report.index == index)
  }
}

/// 批次检测：逐张推理、提取记录并汇总，不做任何渲染
pub struct DetectionWorkflow<'a> {
  detector: &'a dyn Detector,
}

impl<'a> DetectionWorkflow<'a> {
  pub fn new(detector: &'a dyn Detector) -> Self {
    Self { detector }
  }

  /// 顺序处理整个批次；单张图片失败只记录并跳过
  pub fn run(&self, batch: &UploadBatch, params: &InferenceParameters) -> BatchOutcome {
    if batch.is_empty() {
      info!("批次为空，跳过推理");
      return BatchOutcome {
        parameters: *params,
        outcomes: Vec::new(),
        table: AggregateTable::default(),
      };
    }

    info!(
      "开始检测 {} 张图片 (conf={:.2}, iou={:.2}, imgsz={})",
      batch.len(),
      params.confidence_threshold(),
      params.iou_threshold(),
      params.input_size().pixels()
    );
    let started = Instant::now();

    let mut outcomes = Vec::with_capacity(batch.len());
    for (index, upload) in batch.iter() {
      info!("处理第 {} 张图片: {}", index, upload.name);
      match self.process_image(index, upload, params) {
        Ok(report) => {
          info!(
            "第 {} 张图片检测到 {} 个瑕疵，耗时: {:.2?}",
            index,
            report.detections.len(),
            report.elapsed
          );
          outcomes.push(ImageOutcome::Processed(report));
        }
        Err(e) => {
          warn!("第 {} 张图片 {} 处理失败: {}", index, upload.name, e);
          outcomes.push(ImageOutcome::Failed(ImageFailure {
            index,
            name: upload.name.clone(),
            reason: e.to_string(),
          }));
        }
      }
    }

    let table = AggregateTable::aggregate(outcomes.iter().filter_map(|outcome| match outcome {
      ImageOutcome::Processed(report) => Some(report.detections.clone()),
      ImageOutcome::Failed(_) => None,
    }));
    info!(
      "批次完成，共 {} 条检测记录，总耗时: {:.2?}",
      table.len(),
      started.elapsed()
    );

    BatchOutcome {
      parameters: *params,
      outcomes,
      table,
    }
  }

  fn process_image(
    &self,
    index: usize,
    upload: &UploadedImage,
    params: &InferenceParameters,
  ) -> Result<ImageReport, ImageError> {
    let image = image::load_from_memory(&upload.data)?.to_rgb8();
    debug!("图片尺寸: {}x{}", image.width(), image.height());

    let now = Instant::now();
    let result = self.detector.detect(&image, params)?;
    let elapsed = now.elapsed();

    let detections = extract_detections(&upload.name, &result, self.detector.labels());
    for det in &detections {
      debug!("  - {}: {:.4}", det.defect_label, det.probability);
    }

    Ok(ImageReport {
      index,
      name: upload.name.clone(),
      image,
      result,
      detections,
      elapsed,
    })
  }
}

// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/report.rs - 检测记录提取与汇总表
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

use std::fmt;

use serde::Serialize;

use crate::model::{DetectResult, LabelMap};

const PROBABILITY_SCALE: f64 = 10_000.0;

/// 汇总表中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  #[serde(rename = "image")]
  pub image_name: String,
  #[serde(rename = "defect")]
  pub defect_label: String,
  pub probability: f64,
}

/// 保留 4 位小数（四舍五入，远离零）
pub fn round_probability(score: f32) -> f64 {
  (score as f64 * PROBABILITY_SCALE).round() / PROBABILITY_SCALE
}

/// 按模型返回的顺序把检测框转换为记录
pub fn extract_detections(image_name: &str, result: &DetectResult, labels: &LabelMap) -> Vec<Detection> {
  result
    .items
    .iter()
    .map(|item| Detection {
      image_name: image_name.to_string(),
      defect_label: labels.label(item.class_id),
      probability: round_probability(item.score),
    })
    .collect()
}

/// 全批次检测记录，按概率降序
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AggregateTable {
  rows: Vec<Detection>,
}

impl AggregateTable {
  /// 拼接各图片的记录后稳定排序，概率相同的保持原顺序
  pub fn aggregate<I>(per_image: I) -> Self
  where
    I: IntoIterator<Item = Vec<Detection>>,
  {
    let mut rows: Vec<Detection> = per_image.into_iter().flatten().collect();
    rows.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    Self { rows }
  }

  pub fn rows(&self) -> &[Detection] {
    &self.rows
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }
}

impl fmt::Display for AggregateTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let image_width = self
      .rows
      .iter()
      .map(|row| row.image_name.chars().count())
      .chain(std::iter::once("Image".len()))
      .max()
      .unwrap_or_default();
    let defect_width = self
      .rows
      .iter()
      .map(|row| row.defect_label.chars().count())
      .chain(std::iter::once("Defect".len()))
      .max()
      .unwrap_or_default();

    writeln!(
      f,
      "{:<iw$}  {:<dw$}  Probability",
      "Image",
      "Defect",
      iw = image_width,
      dw = defect_width
    )?;
    for row in &self.rows {
      writeln!(
        f,
        "{:<iw$}  {:<dw$}  {:.4}",
        row.image_name,
        row.defect_label,
        row.probability,
        iw = image_width,
        dw = defect_width
      )?;
    }
    Ok(())
  }
}

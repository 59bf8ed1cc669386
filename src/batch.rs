// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/batch.rs - 上传批次与批次校验
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
use std::path::Path;

use serde::Serialize;
use tracing::warn;

/// 单次运行最多处理的图片数量
pub const MAX_BATCH_SIZE: usize = 5;

/// 上传边界接受的扩展名及其 MIME 类型
pub const ACCEPTED_TYPES: [(&str, &str); 3] = [
  ("jpg", "image/jpeg"),
  ("jpeg", "image/jpeg"),
  ("png", "image/png"),
];

/// 用户上传的一张原始图片
#[derive(Clone, PartialEq, Eq)]
pub struct UploadedImage {
  pub name: String,
  pub data: Vec<u8>,
}

impl fmt::Debug for UploadedImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UploadedImage")
      .field("name", &self.name)
      .field("bytes", &self.data.len())
      .finish()
  }
}

impl UploadedImage {
  pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
    Self {
      name: name.into(),
      data: data.into(),
    }
  }

  pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let name = path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| path.display().to_string());
    Ok(Self { name, data })
  }

  pub fn has_accepted_extension(&self) -> bool {
    is_accepted_file_name(&self.name)
  }

  pub fn content_type(&self) -> Option<&'static str> {
    content_type_for(&self.name)
  }
}

/// 按扩展名（不区分大小写）查 MIME 类型，不接受的文件返回 `None`
pub fn content_type_for(name: &str) -> Option<&'static str> {
  let ext = Path::new(name).extension()?.to_string_lossy().to_lowercase();
  ACCEPTED_TYPES
    .iter()
    .find(|(accepted, _)| *accepted == ext)
    .map(|(_, mime)| *mime)
}

pub fn is_accepted_file_name(name: &str) -> bool {
  content_type_for(name).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchWarning {
  /// 超出上限，只保留前几张
  Truncated { received: usize, kept: usize },
}

impl fmt::Display for BatchWarning {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BatchWarning::Truncated { received, kept } => write!(
        f,
        "Maximum {} images allowed. Received {}, only the first {} will be processed.",
        MAX_BATCH_SIZE, received, kept
      ),
    }
  }
}

/// 一次检测运行的图片批次，长度不超过 [`MAX_BATCH_SIZE`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadBatch {
  images: Vec<UploadedImage>,
}

impl UploadBatch {
  /// 批次校验：超过上限时截断为前 5 张并给出警告
  pub fn validate(mut images: Vec<UploadedImage>) -> (Self, Option<BatchWarning>) {
    let received = images.len();
    if received <= MAX_BATCH_SIZE {
      return (Self { images }, None);
    }

    warn!(
      "上传了 {} 张图片，超过上限 {}，只保留前 {} 张",
      received, MAX_BATCH_SIZE, MAX_BATCH_SIZE
    );
    images.truncate(MAX_BATCH_SIZE);
    (
      Self { images },
      Some(BatchWarning::Truncated {
        received,
        kept: MAX_BATCH_SIZE,
      }),
    )
  }

  pub fn len(&self) -> usize {
    self.images.len()
  }

  pub fn is_empty(&self) -> bool {
    self.images.is_empty()
  }

  /// 按上传顺序遍历，序号从 1 开始
  pub fn iter(&self) -> impl Iterator<Item = (usize, &UploadedImage)> {
    self.images.iter().enumerate().map(|(i, image)| (i + 1, image))
  }

  /// 按 1 开始的序号取图片
  pub fn get(&self, index: usize) -> Option<&UploadedImage> {
    index.checked_sub(1).and_then(|i| self.images.get(i))
  }
}

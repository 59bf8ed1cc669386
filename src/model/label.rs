// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/model/label.rs - 类别标签映射
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

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件格式错误: {0}")]
  TomlError(#[from] toml::de::Error),
  #[error("无效的类别编号: {0}")]
  InvalidId(String),
  #[error("无法解析模型元数据中的类别表: {0}")]
  MetadataError(String),
}

/// 类别编号到瑕疵名称的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
  names: BTreeMap<u32, String>,
}

#[derive(Deserialize)]
struct LabelFile {
  names: BTreeMap<String, String>,
}

impl LabelMap {
  pub fn new(names: BTreeMap<u32, String>) -> Self {
    Self { names }
  }

  /// 未登记的编号退化为编号本身的字符串
  pub fn label(&self, class_id: u32) -> String {
    self
      .names
      .get(&class_id)
      .cloned()
      .unwrap_or_else(|| class_id.to_string())
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
    self.names.iter().map(|(id, name)| (*id, name.as_str()))
  }

  /// 读取 TOML 标签文件，格式为 `[names]` 表下的 `0 = "hole"`
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_toml_str(&text)
  }

  pub fn from_toml_str(text: &str) -> Result<Self, LabelError> {
    let file: LabelFile = toml::from_str(text)?;
    let mut names = BTreeMap::new();
    for (id, name) in file.names {
      let class_id = id
        .trim()
        .parse::<u32>()
        .map_err(|_| LabelError::InvalidId(id.clone()))?;
      names.insert(class_id, name);
    }
    Ok(Self { names })
  }

  /// 解析 Ultralytics 导出时写入元数据的 `names` 字段，例如 `{0: 'hole', 1: 'stain'}`
  pub fn from_ultralytics_names(text: &str) -> Result<Self, LabelError> {
    let malformed = || LabelError::MetadataError(text.to_string());

    let body = text
      .trim()
      .strip_prefix('{')
      .and_then(|s| s.strip_suffix('}'))
      .ok_or_else(malformed)?;

    let mut names = BTreeMap::new();
    let mut rest = body.trim_start();
    while !rest.is_empty() {
      let (id, after) = rest.split_once(':').ok_or_else(malformed)?;
      let class_id = id
        .trim()
        .parse::<u32>()
        .map_err(|_| LabelError::InvalidId(id.trim().to_string()))?;

      let after = after.trim_start();
      let quote = after
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(malformed)?;
      let inner = &after[1..];
      let end = inner.find(quote).ok_or_else(malformed)?;
      names.insert(class_id, inner[..end].to_string());

      rest = inner[end + 1..].trim_start();
      rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    Ok(Self { names })
  }
}

impl<S: Into<String>> FromIterator<(u32, S)> for LabelMap {
  fn from_iter<I: IntoIterator<Item = (u32, S)>>(iter: I) -> Self {
    Self {
      names: iter.into_iter().map(|(id, name)| (id, name.into())).collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unmapped_id_falls_back_to_number() {
    let labels: LabelMap = [(0, "hole"), (1, "stain")].into_iter().collect();
    assert_eq!(labels.label(0), "hole");
    assert_eq!(labels.label(7), "7");
  }

  #[test]
  fn parses_toml_names_table() {
    let labels = LabelMap::from_toml_str(
      r#"
      [names]
      0 = "hole"
      1 = "oil stain"
      "#,
    )
    .unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.label(1), "oil stain");
  }

  #[test]
  fn rejects_non_numeric_toml_keys() {
    let err = LabelMap::from_toml_str("[names]\nhole = \"hole\"\n").unwrap_err();
    assert!(matches!(err, LabelError::InvalidId(id) if id == "hole"));
  }

  #[test]
  fn parses_ultralytics_metadata() {
    let labels =
      LabelMap::from_ultralytics_names("{0: 'hole', 1: \"knot, loose\", 2: 'broken yarn'}").unwrap();
    assert_eq!(labels.label(0), "hole");
    assert_eq!(labels.label(1), "knot, loose");
    assert_eq!(labels.label(2), "broken yarn");
    assert!(LabelMap::from_ultralytics_names("{}").unwrap().is_empty());
  }

  #[test]
  fn rejects_malformed_metadata() {
    assert!(LabelMap::from_ultralytics_names("[0, 1]").is_err());
    assert!(LabelMap::from_ultralytics_names("{0: hole}").is_err());
    assert!(LabelMap::from_ultralytics_names("{x: 'hole'}").is_err());
  }
}

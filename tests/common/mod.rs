// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// tests/common/mod.rs - 集成测试公共代码
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

#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::RgbImage;

pub use fabric_defect::model::{
  DetectItem, DetectResult, Detector, DetectorError, InferenceParameters, LabelMap,
};

/// 按调用顺序返回预设结果的检测器，脚本用完后返回空结果
pub struct ScriptedDetector {
  labels: LabelMap,
  script: Mutex<VecDeque<Result<DetectResult, String>>>,
  calls: AtomicUsize,
}

impl ScriptedDetector {
  pub fn new(script: Vec<Result<DetectResult, String>>) -> Self {
    Self {
      labels: fabric_labels(),
      script: Mutex::new(script.into()),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn empty() -> Self {
    Self::new(Vec::new())
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Detector for ScriptedDetector {
  fn name(&self) -> &str {
    "scripted.onnx"
  }

  fn labels(&self) -> &LabelMap {
    &self.labels
  }

  fn detect(&self, _: &RgbImage, _: &InferenceParameters) -> Result<DetectResult, DetectorError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let next = self
      .script
      .lock()
      .map_err(|_| DetectorError::Poisoned)?
      .pop_front();
    match next {
      Some(Ok(result)) => Ok(result),
      Some(Err(reason)) => Err(DetectorError::Inference(reason)),
      None => Ok(DetectResult::default()),
    }
  }
}

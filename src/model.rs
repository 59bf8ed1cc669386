// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/model.rs - 模型
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

use std::ops::RangeInclusive;
use std::sync::Arc;

use image::RgbImage;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

mod label;
pub use self::label::{LabelError, LabelMap};

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{YoloOnnx, YoloOnnxBuilder, YoloOnnxError};

pub const CONFIDENCE_RANGE: RangeInclusive<f32> = 0.05..=0.95;
pub const IOU_RANGE: RangeInclusive<f32> = 0.10..=0.95;
pub const DEFAULT_CONFIDENCE: f32 = 0.30;
pub const DEFAULT_IOU: f32 = 0.75;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
  #[error("置信度阈值 {0} 超出范围 [0.05, 0.95]")]
  ConfidenceOutOfRange(f32),
  #[error("IoU 阈值 {0} 超出范围 [0.10, 0.95]")]
  IouOutOfRange(f32),
  #[error("不支持的输入尺寸 {0}，可选 640 / 512 / 416")]
  UnsupportedInputSize(u32),
}

/// 模型内部缩放使用的输入边长
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum InputSize {
  #[default]
  S640,
  S512,
  S416,
}

impl InputSize {
  pub const ALL: [InputSize; 3] = [InputSize::S640, InputSize::S512, InputSize::S416];

  pub fn pixels(self) -> u32 {
    match self {
      InputSize::S640 => 640,
      InputSize::S512 => 512,
      InputSize::S416 => 416,
    }
  }
}

impl TryFrom<u32> for InputSize {
  type Error = ParameterError;

  fn try_from(value: u32) -> Result<Self, Self::Error> {
    InputSize::ALL
      .into_iter()
      .find(|size| size.pixels() == value)
      .ok_or(ParameterError::UnsupportedInputSize(value))
  }
}

impl From<InputSize> for u32 {
  fn from(size: InputSize) -> Self {
    size.pixels()
  }
}

/// 单次运行的推理参数，创建后不可修改
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameters")]
pub struct InferenceParameters {
  confidence_threshold: f32,
  iou_threshold: f32,
  input_size: InputSize,
}

#[derive(Deserialize)]
struct RawParameters {
  confidence_threshold: f32,
  iou_threshold: f32,
  input_size: u32,
}

impl TryFrom<RawParameters> for InferenceParameters {
  type Error = ParameterError;

  fn try_from(raw: RawParameters) -> Result<Self, Self::Error> {
    InferenceParameters::new(
      raw.confidence_threshold,
      raw.iou_threshold,
      InputSize::try_from(raw.input_size)?,
    )
  }
}

impl Default for InferenceParameters {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE,
      iou_threshold: DEFAULT_IOU,
      input_size: InputSize::default(),
    }
  }
}

impl InferenceParameters {
  pub fn new(
    confidence_threshold: f32,
    iou_threshold: f32,
    input_size: InputSize,
  ) -> Result<Self, ParameterError> {
    if !CONFIDENCE_RANGE.contains(&confidence_threshold) {
      return Err(ParameterError::ConfidenceOutOfRange(confidence_threshold));
    }
    if !IOU_RANGE.contains(&iou_threshold) {
      return Err(ParameterError::IouOutOfRange(iou_threshold));
    }
    Ok(Self {
      confidence_threshold,
      iou_threshold,
      input_size,
    })
  }

  pub fn confidence_threshold(&self) -> f32 {
    self.confidence_threshold
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  pub fn input_size(&self) -> InputSize {
    self.input_size
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，相对原图归一化
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
  #[error("模型会话锁已失效")]
  Poisoned,
  #[cfg(feature = "model_onnx")]
  #[error("ONNX Runtime 错误: {0}")]
  Ort(#[from] ort::Error),
}

/// 预训练检测器的窄接口，工作流只依赖这里
pub trait Detector: Send + Sync {
  /// 模型名称（通常是权重文件名）
  fn name(&self) -> &str;

  /// 类别编号到瑕疵名称的映射，在模型生命周期内固定
  fn labels(&self) -> &LabelMap;

  fn detect(
    &self,
    image: &RgbImage,
    params: &InferenceParameters,
  ) -> Result<DetectResult, DetectorError>;
}

type Loader = Box<dyn Fn() -> anyhow::Result<Arc<dyn Detector>> + Send + Sync>;

/// 进程级模型槽位：首次访问时加载，之后只读复用
pub struct ModelSlot {
  cell: OnceCell<Arc<dyn Detector>>,
  loader: Loader,
}

impl ModelSlot {
  pub fn new<F>(loader: F) -> Self
  where
    F: Fn() -> anyhow::Result<Arc<dyn Detector>> + Send + Sync + 'static,
  {
    Self {
      cell: OnceCell::new(),
      loader: Box::new(loader),
    }
  }

  pub fn preloaded(detector: Arc<dyn Detector>) -> Self {
    Self {
      cell: OnceCell::with_value(detector),
      loader: Box::new(|| Err(anyhow::anyhow!("模型已预加载，不应再次加载"))),
    }
  }

  pub fn get(&self) -> anyhow::Result<Arc<dyn Detector>> {
    self
      .cell
      .get_or_try_init(|| {
        info!("首次使用，加载模型...");
        let now = std::time::Instant::now();
        let detector = (self.loader)()?;
        info!("模型 {} 加载完成，耗时: {:.2?}", detector.name(), now.elapsed());
        Ok(detector)
      })
      .cloned()
  }

  pub fn is_loaded(&self) -> bool {
    self.cell.get().is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Nothing(LabelMap);

  impl Detector for Nothing {
    fn name(&self) -> &str {
      "nothing"
    }

    fn labels(&self) -> &LabelMap {
      &self.0
    }

    fn detect(&self, _: &RgbImage, _: &InferenceParameters) -> Result<DetectResult, DetectorError> {
      Ok(DetectResult::default())
    }
  }

  #[test]
  fn default_parameters_match_controls() {
    let params = InferenceParameters::default();
    assert_eq!(params.confidence_threshold(), 0.30);
    assert_eq!(params.iou_threshold(), 0.75);
    assert_eq!(params.input_size().pixels(), 640);
  }

  #[test]
  fn parameters_reject_out_of_range() {
    assert_eq!(
      InferenceParameters::new(0.01, 0.5, InputSize::S640),
      Err(ParameterError::ConfidenceOutOfRange(0.01))
    );
    assert_eq!(
      InferenceParameters::new(0.5, 0.99, InputSize::S640),
      Err(ParameterError::IouOutOfRange(0.99))
    );
    assert!(InferenceParameters::new(f32::NAN, 0.5, InputSize::S640).is_err());
    assert!(InferenceParameters::new(0.05, 0.10, InputSize::S416).is_ok());
    assert!(InferenceParameters::new(0.95, 0.95, InputSize::S512).is_ok());
  }

  #[test]
  fn input_size_only_accepts_known_values() {
    assert_eq!(InputSize::try_from(512), Ok(InputSize::S512));
    assert_eq!(
      InputSize::try_from(320),
      Err(ParameterError::UnsupportedInputSize(320))
    );
  }

  #[test]
  fn parameters_deserialize_with_validation() {
    let ok: InferenceParameters = serde_json::from_str(
      r#"{"confidence_threshold":0.4,"iou_threshold":0.5,"input_size":416}"#,
    )
    .unwrap();
    assert_eq!(ok.input_size(), InputSize::S416);

    let bad = serde_json::from_str::<InferenceParameters>(
      r#"{"confidence_threshold":0.4,"iou_threshold":0.5,"input_size":300}"#,
    );
    assert!(bad.is_err());
  }

  #[test]
  fn model_slot_loads_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slot = ModelSlot::new(move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Arc::new(Nothing(LabelMap::default())) as Arc<dyn Detector>)
    });

    assert!(!slot.is_loaded());
    let first = slot.get().unwrap();
    let second = slot.get().unwrap();
    assert!(slot.is_loaded());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
  }

  #[test]
  fn model_slot_retries_after_failed_load() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slot = ModelSlot::new(move || {
      if counter.fetch_add(1, Ordering::SeqCst) == 0 {
        anyhow::bail!("权重文件不存在");
      }
      Ok(Arc::new(Nothing(LabelMap::default())) as Arc<dyn Detector>)
    });

    assert!(slot.get().is_err());
    assert!(slot.get().is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}

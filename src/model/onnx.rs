// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 上的 YOLOv8 检测模型
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

use std::path::PathBuf;
use std::sync::Mutex;

use image::{Rgb, RgbImage, imageops::FilterType};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2, IxDyn};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::{Tensor, ValueType};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{
    DetectItem, DetectResult, Detector, DetectorError, InferenceParameters, LabelError, LabelMap,
  },
};

const YOLO_NUM_INPUTS: usize = 1;
const YOLO_BOX_CHANNELS: usize = 4;
const YOLO_MAX_DETECTIONS: usize = 300;
const LETTERBOX_FILL: u8 = 114;
const DEFAULT_INTRA_THREADS: usize = 4;
const METADATA_NAMES_KEY: &str = "names";

pub struct YoloOnnx {
  name: String,
  session: Mutex<Session>,
  labels: LabelMap,
  fixed_input: Option<u32>,
}

#[derive(Error, Debug)]
pub enum YoloOnnxError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("标签错误: {0}")]
  LabelError(#[from] LabelError),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

pub struct YoloOnnxBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  intra_threads: usize,
}

impl FromUrlWithScheme for YoloOnnxBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for YoloOnnxBuilder {
  type Error = YoloOnnxError;

  /// `onnx:///models/best.onnx?labels=/models/labels.toml&threads=4`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloOnnxError::ModelPathError(format!(
        "模型路径必须使用 {} 方案, 实际为 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    if let Some(host) = url.host_str().filter(|host| !host.is_empty()) {
      return Err(YoloOnnxError::ModelPathError(format!(
        "模型地址不能包含主机名 '{}'，本地路径请写成 {}:///path/to/model.onnx",
        host,
        Self::SCHEME
      )));
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| YoloOnnxError::ModelPathError(e.to_string()))?;
    if path.is_empty() {
      return Err(YoloOnnxError::ModelPathError("模型路径为空".to_string()));
    }

    let mut builder = YoloOnnxBuilder::new(path.as_ref());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "labels" => builder = builder.labels(value.as_ref()),
        "threads" => {
          let threads = value
            .parse::<usize>()
            .map_err(|_| YoloOnnxError::ModelPathError(format!("无效的线程数: {}", value)))?;
          builder = builder.intra_threads(threads);
        }
        other => warn!("忽略未知的模型参数: {}", other),
      }
    }
    Ok(builder)
  }
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      intra_threads: DEFAULT_INTRA_THREADS,
    }
  }

  pub fn labels(mut self, path: impl Into<PathBuf>) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn intra_threads(mut self, threads: usize) -> Self {
    self.intra_threads = threads.max(1);
    self
  }

  pub fn build(self) -> Result<YoloOnnx, YoloOnnxError> {
    info!("加载模型文件: {}", self.model_path.display());
    if !self.model_path.exists() {
      return Err(YoloOnnxError::ModelPathError(format!(
        "模型文件不存在: {}",
        self.model_path.display()
      )));
    }

    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(self.intra_threads)?
      .commit_from_file(&self.model_path)?;
    info!("ONNX 会话创建完成");

    if session.inputs.len() != YOLO_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLO_NUM_INPUTS,
        session.inputs.len()
      );
      return Err(YoloOnnxError::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLO_NUM_INPUTS,
        session.inputs.len()
      )));
    }
    if session.outputs.is_empty() {
      return Err(YoloOnnxError::ModelInvalid("模型没有输出".to_string()));
    }

    let fixed_input = match &session.inputs[0].input_type {
      ValueType::Tensor { shape, .. } if shape.len() == 4 => {
        debug!("模型输入形状: {:?}", shape);
        fixed_square_input(shape)?
      }
      other => {
        error!("预期 NCHW 四维输入, 实际为 {:?}", other);
        return Err(YoloOnnxError::ModelInvalid(format!(
          "预期 NCHW 四维输入, 实际为 {:?}",
          other
        )));
      }
    };
    match fixed_input {
      Some(size) => info!("模型输入尺寸固定为 {}", size),
      None => info!("模型输入尺寸为动态"),
    }

    let labels = match &self.labels_path {
      Some(path) => {
        info!("从 {} 读取类别标签", path.display());
        LabelMap::from_toml_file(path)?
      }
      None => {
        let metadata = session.metadata()?;
        match metadata.custom(METADATA_NAMES_KEY)? {
          Some(names) => LabelMap::from_ultralytics_names(&names)?,
          None => {
            warn!("模型元数据中没有类别表，使用类别编号作为标签");
            LabelMap::default()
          }
        }
      }
    };
    info!("类别数量: {}", labels.len());
    for (id, name) in labels.iter() {
      debug!("类别 {}: {}", id, name);
    }

    let name = self
      .model_path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| self.model_path.display().to_string());

    Ok(YoloOnnx {
      name,
      session: Mutex::new(session),
      labels,
      fixed_input,
    })
  }
}

impl YoloOnnx {
  fn input_size_for(&self, params: &InferenceParameters) -> u32 {
    let requested = params.input_size().pixels();
    match self.fixed_input {
      Some(fixed) if fixed != requested => {
        warn!(
          "模型输入尺寸固定为 {}, 忽略请求的尺寸 {}",
          fixed, requested
        );
        fixed
      }
      Some(fixed) => fixed,
      None => requested,
    }
  }
}

impl Detector for YoloOnnx {
  fn name(&self) -> &str {
    &self.name
  }

  fn labels(&self) -> &LabelMap {
    &self.labels
  }

  fn detect(
    &self,
    image: &RgbImage,
    params: &InferenceParameters,
  ) -> Result<DetectResult, DetectorError> {
    if image.width() == 0 || image.height() == 0 {
      return Ok(DetectResult::default());
    }

    let size = self.input_size_for(params);
    let letterbox = Letterbox::new(image.width(), image.height(), size);
    debug!("设置模型输入: {:?}", letterbox);
    let input_shape = vec![1i64, 3, size as i64, size as i64];
    let input = Tensor::from_array((input_shape, letterbox.tensor(image)))?;

    let candidates = {
      let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
      debug!("执行模型推理");
      let outputs = session.run(ort::inputs![input])?;
      let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
      let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
      debug!("模型输出形状: {:?}", dims);
      let view = ArrayViewD::from_shape(IxDyn(&dims), data)
        .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;
      decode_predictions(view, params.confidence_threshold())?
    };
    debug!("置信度过滤后候选框: {}", candidates.len());

    let items: Vec<DetectItem> = nms(candidates, params.iou_threshold())
      .into_iter()
      .take(YOLO_MAX_DETECTIONS)
      .map(|item| DetectItem {
        bbox: letterbox.restore(item.bbox, image.width(), image.height()),
        ..item
      })
      .collect();

    debug!("检测到 {} 个目标", items.len());
    Ok(DetectResult::from(items))
  }
}

/// NCHW 输入的空间尺寸：两边都是动态时返回 `None`，固定时必须是正方形
fn fixed_square_input(shape: &[i64]) -> Result<Option<u32>, YoloOnnxError> {
  let (height, width) = (shape[2], shape[3]);
  match (height > 0, width > 0) {
    (false, false) => Ok(None),
    (true, true) if height == width => Ok(Some(height as u32)),
    _ => {
      error!("模型输入 {}x{} 不是正方形或只有一边固定", height, width);
      Err(YoloOnnxError::ModelInvalid(format!(
        "预期正方形或动态输入, 实际为 {}x{}",
        height, width
      )))
    }
  }
}

/// 解码 `[1, 4 + nc, N]`（或转置后的 `[1, N, 4 + nc]`）输出，框坐标仍在模型输入空间
fn decode_predictions(
  output: ArrayViewD<'_, f32>,
  confidence_threshold: f32,
) -> Result<Vec<DetectItem>, DetectorError> {
  if output.ndim() != 3 || output.shape()[0] != 1 {
    return Err(DetectorError::InvalidOutput(format!(
      "预期输出形状为 [1, C, N], 实际为 {:?}",
      output.shape()
    )));
  }

  let preds: ArrayView2<'_, f32> = output
    .index_axis_move(Axis(0), 0)
    .into_dimensionality::<Ix2>()
    .map_err(|e| DetectorError::InvalidOutput(e.to_string()))?;
  // 候选数远大于通道数
  let preds = if preds.shape()[0] > preds.shape()[1] {
    preds.reversed_axes()
  } else {
    preds
  };

  let channels = preds.shape()[0];
  if channels <= YOLO_BOX_CHANNELS {
    return Err(DetectorError::InvalidOutput(format!(
      "输出通道数 {} 不足以包含类别分数",
      channels
    )));
  }

  let mut items = Vec::new();
  for i in 0..preds.shape()[1] {
    let (class_id, score) = (YOLO_BOX_CHANNELS..channels)
      .map(|c| (c - YOLO_BOX_CHANNELS, preds[[c, i]]))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score <= confidence_threshold {
      continue;
    }

    let cx = preds[[0, i]];
    let cy = preds[[1, i]];
    let w = preds[[2, i]];
    let h = preds[[3, i]];

    items.push(DetectItem {
      class_id: class_id as u32,
      score,
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
    });
  }

  Ok(items)
}

/// 非极大值抑制，只在同类别之间比较
fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|best| best.class_id == item.class_id && iou(&best.bbox, &item.bbox) > iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 保持宽高比缩放并用灰色填充到正方形输入
#[derive(Debug, Clone, PartialEq)]
struct Letterbox {
  size: u32,
  scale: f32,
  new_width: u32,
  new_height: u32,
  pad_x: u32,
  pad_y: u32,
}

impl Letterbox {
  fn new(width: u32, height: u32, size: u32) -> Self {
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);
    Self {
      size,
      scale,
      new_width,
      new_height,
      pad_x: (size - new_width) / 2,
      pad_y: (size - new_height) / 2,
    }
  }

  /// NCHW、RGB、归一化到 [0, 1]
  fn tensor(&self, image: &RgbImage) -> Vec<f32> {
    let resized = image::imageops::resize(
      image,
      self.new_width,
      self.new_height,
      FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([LETTERBOX_FILL; 3]));
    image::imageops::overlay(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);

    let plane = (self.size as usize) * (self.size as usize);
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
      let idx = (y as usize) * (self.size as usize) + (x as usize);
      for c in 0..3 {
        data[c * plane + idx] = pixel[c] as f32 / 255.0;
      }
    }
    data
  }

  /// 模型输入空间的框映射回原图，并归一化
  fn restore(&self, bbox: [f32; 4], width: u32, height: u32) -> [f32; 4] {
    let (w, h) = (width as f32, height as f32);
    let x = |v: f32| ((v - self.pad_x as f32) / self.scale).clamp(0.0, w) / w;
    let y = |v: f32| ((v - self.pad_y as f32) / self.scale).clamp(0.0, h) / h;
    [x(bbox[0]), y(bbox[1]), x(bbox[2]), y(bbox[3])]
  }
}

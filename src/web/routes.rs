// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/web/routes.rs - HTTP 处理函数
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

use axum::{
  Json,
  extract::{Multipart, Path, State, multipart::MultipartError, rejection::JsonRejection},
  http::{HeaderValue, StatusCode, header, header::InvalidHeaderValue},
  response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  batch::{BatchWarning, MAX_BATCH_SIZE, UploadBatch, UploadedImage, is_accepted_file_name},
  model::{
    CONFIDENCE_RANGE, DEFAULT_CONFIDENCE, DEFAULT_IOU, IOU_RANGE, InferenceParameters, InputSize,
  },
  output::{AnnotatedImage, Annotator, PngExport},
  report::{AggregateTable, Detection},
  web::state::{HttpState, RunRecord},
  workflow::{DetectionWorkflow, ImageOutcome, RunStatus},
};

const SLIDER_STEP: f32 = 0.05;

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("上传数据无效: {0}")]
  Multipart(#[from] MultipartError),
  #[error("参数无效: {0}")]
  InvalidParameters(String),
  #[error("模型不可用: {0}")]
  ModelUnavailable(String),
  #[error("{0}")]
  NotFound(String),
  #[error("会话状态锁已失效")]
  Poisoned,
  #[error("后台任务失败: {0}")]
  Join(#[from] tokio::task::JoinError),
  #[error("无效的响应头: {0}")]
  InvalidHeader(#[from] InvalidHeaderValue),
}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      ApiError::Multipart(e) => e.status(),
      ApiError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Poisoned | ApiError::Join(_) | ApiError::InvalidHeader(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!("请求处理失败: {}", self);
    } else {
      warn!("请求被拒绝: {}", self);
    }
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
  pub index: usize,
  pub name: String,
  pub detections: Vec<Detection>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub download_url: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
  pub status: RunStatus,
  pub message: String,
  pub warning: Option<String>,
  pub parameters: InferenceParameters,
  pub images: Vec<ImageEntry>,
  pub table: AggregateTable,
  pub finished_at: String,
}

#[derive(Debug, Serialize)]
pub struct UploadedEntry {
  pub index: usize,
  pub name: String,
  pub bytes: usize,
  pub preview_url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
  pub images: Vec<UploadedEntry>,
  pub rejected: Vec<String>,
  pub warning: Option<String>,
}

pub async fn index() -> Html<&'static str> {
  Html(include_str!("index.html"))
}

pub async fn get_config(State(state): State<HttpState>) -> Result<Json<serde_json::Value>, ApiError> {
  let parameters = state.session()?.parameters;
  let model = if state.model.is_loaded() {
    state.model.get().ok().map(|detector| detector.name().to_string())
  } else {
    None
  };

  Ok(Json(json!({
    "confidence_threshold": {
      "min": CONFIDENCE_RANGE.start(),
      "max": CONFIDENCE_RANGE.end(),
      "step": SLIDER_STEP,
      "default": DEFAULT_CONFIDENCE,
    },
    "iou_threshold": {
      "min": IOU_RANGE.start(),
      "max": IOU_RANGE.end(),
      "step": SLIDER_STEP,
      "default": DEFAULT_IOU,
    },
    "input_size": {
      "options": InputSize::ALL.map(InputSize::pixels),
      "default": InputSize::default().pixels(),
    },
    "max_images": MAX_BATCH_SIZE,
    "model": model,
    "parameters": parameters,
  })))
}

// 浏览器可能带上客户端路径，只保留文件名
fn base_name(name: &str) -> &str {
  name.rsplit(['/', '\\']).next().unwrap_or(name)
}

pub async fn upload_images(
  State(state): State<HttpState>,
  mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
  let mut images = Vec::new();
  let mut rejected = Vec::new();

  while let Some(field) = multipart.next_field().await? {
    let Some(name) = field.file_name().map(|name| base_name(name).to_string()) else {
      continue;
    };
    let data = field.bytes().await?;
    if name.is_empty() || !is_accepted_file_name(&name) {
      warn!("拒绝不支持的文件: {:?}", name);
      rejected.push(name);
      continue;
    }
    images.push(UploadedImage::new(name, data.to_vec()));
  }

  let (batch, warning) = UploadBatch::validate(images);
  info!("收到 {} 张图片，拒绝 {} 个文件", batch.len(), rejected.len());

  let entries = batch
    .iter()
    .map(|(index, image)| UploadedEntry {
      index,
      name: image.name.clone(),
      bytes: image.data.len(),
      preview_url: format!("/api/images/{}", index),
    })
    .collect();

  let mut session = state.session()?;
  session.batch = batch;
  session.warning = warning;
  session.last_run = None;
  session.generation += 1;

  Ok(Json(UploadResponse {
    images: entries,
    rejected,
    warning: warning.as_ref().map(BatchWarning::to_string),
  }))
}

pub async fn get_image(
  State(state): State<HttpState>,
  Path(index): Path<usize>,
) -> Result<Response, ApiError> {
  let session = state.session()?;
  let image = session
    .batch
    .get(index)
    .ok_or_else(|| ApiError::NotFound(format!("没有第 {} 张上传图片", index)))?;

  // 批次里只有通过扩展名检查的图片
  let content_type = image
    .content_type()
    .unwrap_or("application/octet-stream");
  Ok(([(header::CONTENT_TYPE, content_type)], image.data.clone()).into_response())
}

pub async fn set_parameters(
  State(state): State<HttpState>,
  payload: Result<Json<InferenceParameters>, JsonRejection>,
) -> Result<Json<InferenceParameters>, ApiError> {
  let Json(parameters) = payload.map_err(|e| ApiError::InvalidParameters(e.body_text()))?;
  info!(
    "更新参数: conf={:.2}, iou={:.2}, imgsz={}",
    parameters.confidence_threshold(),
    parameters.iou_threshold(),
    parameters.input_size().pixels()
  );
  state.session()?.parameters = parameters;
  Ok(Json(parameters))
}

pub async fn run_detection(State(state): State<HttpState>) -> Result<Json<RunResponse>, ApiError> {
  let (batch, parameters, warning, generation) = {
    let session = state.session()?;
    (
      session.batch.clone(),
      session.parameters,
      session.warning,
      session.generation,
    )
  };

  let worker = state.clone();
  let record =
    tokio::task::spawn_blocking(move || execute_run(&worker, &batch, &parameters, warning))
      .await??;
  let response = record.response.clone();

  let mut session = state.session()?;
  if session.generation == generation {
    session.last_run = Some(record);
  } else {
    warn!("运行期间批次已被替换，丢弃本次结果");
  }
  Ok(Json(response))
}

fn execute_run(
  state: &HttpState,
  batch: &UploadBatch,
  parameters: &InferenceParameters,
  warning: Option<BatchWarning>,
) -> Result<RunRecord, ApiError> {
  let warning = warning.as_ref().map(BatchWarning::to_string);
  let finished = |status: RunStatus, images: Vec<ImageEntry>, table: AggregateTable| RunResponse {
    status,
    message: status.message().to_string(),
    warning: warning.clone(),
    parameters: *parameters,
    images,
    table,
    finished_at: chrono::Local::now().to_rfc3339(),
  };

  if batch.is_empty() {
    return Ok(RunRecord {
      response: finished(RunStatus::NoImages, Vec::new(), AggregateTable::default()),
      images: BTreeMap::new(),
    });
  }

  let detector = state
    .model
    .get()
    .map_err(|e| ApiError::ModelUnavailable(format!("{:#}", e)))?;
  let outcome = DetectionWorkflow::new(detector.as_ref()).run(batch, parameters);
  let export = PngExport::new(Annotator::new(&state.draw, detector.labels()));

  let mut annotated: BTreeMap<usize, AnnotatedImage> = BTreeMap::new();
  let mut entries = Vec::with_capacity(outcome.outcomes.len());
  for image_outcome in &outcome.outcomes {
    let entry = match image_outcome {
      ImageOutcome::Processed(report) => match export.export_report(report) {
        Ok(image) => {
          annotated.insert(report.index, image);
          ImageEntry {
            index: report.index,
            name: report.name.clone(),
            detections: report.detections.clone(),
            download_url: Some(format!("/api/results/{}/image", report.index)),
            error: None,
          }
        }
        Err(e) => {
          warn!("第 {} 张图片导出失败: {}", report.index, e);
          ImageEntry {
            index: report.index,
            name: report.name.clone(),
            detections: report.detections.clone(),
            download_url: None,
            error: Some(e.to_string()),
          }
        }
      },
      ImageOutcome::Failed(failure) => ImageEntry {
        index: failure.index,
        name: failure.name.clone(),
        detections: Vec::new(),
        download_url: None,
        error: Some(failure.reason.clone()),
      },
    };
    entries.push(entry);
  }

  Ok(RunRecord {
    response: finished(outcome.status(), entries, outcome.table),
    images: annotated,
  })
}

// 非 ASCII 字符放在 filename* 中，filename 只保留可打印 ASCII
fn content_disposition(file_name: &str) -> String {
  let fallback: String = file_name
    .chars()
    .map(|c| {
      if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
        c
      } else {
        '_'
      }
    })
    .collect();
  format!(
    "attachment; filename=\"{}\"; filename*=UTF-8''{}",
    fallback,
    urlencoding::encode(file_name)
  )
}

pub async fn download_result(
  State(state): State<HttpState>,
  Path(index): Path<usize>,
) -> Result<Response, ApiError> {
  let session = state.session()?;
  let image = session
    .last_run
    .as_ref()
    .and_then(|run| run.images.get(&index))
    .ok_or_else(|| ApiError::NotFound(format!("没有第 {} 张图片的检测结果", index)))?;

  let headers = [
    (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
    (
      header::CONTENT_DISPOSITION,
      HeaderValue::from_str(&content_disposition(&image.file_name))?,
    ),
  ];
  Ok((headers, image.png.clone()).into_response())
}

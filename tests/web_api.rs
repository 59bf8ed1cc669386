// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// tests/web_api.rs - HTTP 接口集成测试
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

mod common;

use std::sync::Arc;

use axum::{
  Router,
  body::Body,
  http::{Request, StatusCode, header},
  response::Response,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::*;
use fabric_defect::{
  model::ModelSlot,
  output::Draw,
  web::{HttpState, router},
};

const BOUNDARY: &str = "fabric-defect-test-boundary";

fn app_with(detector: Arc<ScriptedDetector>) -> Router {
  let slot = ModelSlot::preloaded(detector);
  let state = HttpState::new(Arc::new(slot), Arc::new(Draw::new(None)));
  router(state, 8 * 1024 * 1024)
}

fn multipart_body(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
  let mut body = Vec::new();
  for (name, data) in files {
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
      format!(
        "Content-Disposition: form-data; name=\"images\"; filename=\"{}\"\r\n",
        name
      )
      .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
  }
  body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
  body
}

async fn send(app: &Router, request: Request<Body>) -> Response {
  app.clone().oneshot(request).await.unwrap()
}

async fn upload(app: &Router, files: &[(&str, Vec<u8>)]) -> Response {
  let request = Request::builder()
    .method("POST")
    .uri("/api/images")
    .header(
      header::CONTENT_TYPE,
      format!("multipart/form-data; boundary={}", BOUNDARY),
    )
    .body(Body::from(multipart_body(files)))
    .unwrap();
  send(app, request).await
}

async fn get(app: &Router, uri: &str) -> Response {
  send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

async fn run(app: &Router) -> Response {
  let request = Request::builder()
    .method("POST")
    .uri("/api/run")
    .body(Body::empty())
    .unwrap();
  send(app, request).await
}

async fn put_parameters(app: &Router, payload: Value) -> Response {
  let request = Request::builder()
    .method("PUT")
    .uri("/api/parameters")
    .header(header::CONTENT_TYPE, "application/json")
    .body(Body::from(payload.to_string()))
    .unwrap();
  send(app, request).await
}

async fn body_bytes(response: Response) -> Vec<u8> {
  response
    .into_body()
    .collect()
    .await
    .unwrap()
    .to_bytes()
    .to_vec()
}

async fn json_body(response: Response) -> Value {
  serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn png(name: &str) -> (&str, Vec<u8>) {
  (name, png_bytes(&cloth(32, 32)))
}

#[tokio::test]
async fn index_serves_the_page() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));
  let response = get(&app, "/").await;
  assert_eq!(response.status(), StatusCode::OK);
  let html = String::from_utf8(body_bytes(response).await).unwrap();
  assert!(html.contains("Fabric Defect Detection"));
}

#[tokio::test]
async fn config_reports_defaults_and_model() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));
  let config = json_body(get(&app, "/api/config").await).await;

  assert_eq!(config["max_images"], 5);
  assert_eq!(config["model"], "scripted.onnx");
  assert_eq!(config["input_size"]["options"], json!([640, 512, 416]));
  assert_eq!(config["parameters"]["input_size"], 640);
  let conf = config["parameters"]["confidence_threshold"].as_f64().unwrap();
  assert!((conf - 0.30).abs() < 1e-6);
}

#[tokio::test]
async fn run_without_images_prompts_for_upload() {
  let detector = Arc::new(ScriptedDetector::empty());
  let app = app_with(detector.clone());

  let response = run(&app).await;
  assert_eq!(response.status(), StatusCode::OK);
  let body = json_body(response).await;
  assert_eq!(body["status"], "no_images");
  assert!(body["message"].as_str().unwrap().starts_with("Upload"));
  assert_eq!(body["table"], json!([]));
  assert_eq!(detector.calls(), 0);
}

#[tokio::test]
async fn upload_rejects_other_types_and_truncates() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));
  let files = vec![
    png("1.png"),
    ("notes.txt", b"hello".to_vec()),
    png("2.PNG"),
    png("3.png"),
    png("4.png"),
    png("5.png"),
    png("6.png"),
    png("7.png"),
  ];

  let response = upload(&app, &files).await;
  assert_eq!(response.status(), StatusCode::OK);
  let body = json_body(response).await;

  let names: Vec<&str> = body["images"]
    .as_array()
    .unwrap()
    .iter()
    .map(|image| image["name"].as_str().unwrap())
    .collect();
  assert_eq!(names, vec!["1.png", "2.PNG", "3.png", "4.png", "5.png"]);
  assert_eq!(body["rejected"], json!(["notes.txt"]));
  assert!(body["warning"].as_str().unwrap().contains("Maximum 5 images"));

  let preview = get(&app, "/api/images/2").await;
  assert_eq!(preview.status(), StatusCode::OK);
  assert_eq!(preview.headers()[header::CONTENT_TYPE], "image/png");
  assert_eq!(get(&app, "/api/images/6").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn preview_content_type_matches_extension() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));
  // 预览只按文件名返回原始字节，不解码
  upload(&app, &[png("weave.JPEG"), png("plain.png")]).await;

  let first = get(&app, "/api/images/1").await;
  assert_eq!(first.headers()[header::CONTENT_TYPE], "image/jpeg");
  let second = get(&app, "/api/images/2").await;
  assert_eq!(second.headers()[header::CONTENT_TYPE], "image/png");
}

#[tokio::test]
async fn out_of_range_parameters_are_rejected() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));

  let response = put_parameters(
    &app,
    json!({ "confidence_threshold": 0.99, "iou_threshold": 0.5, "input_size": 640 }),
  )
  .await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);

  let response = put_parameters(
    &app,
    json!({ "confidence_threshold": 0.5, "iou_threshold": 0.5, "input_size": 300 }),
  )
  .await;
  assert_eq!(response.status(), StatusCode::BAD_REQUEST);

  // 失败的更新不影响已有参数
  let config = json_body(get(&app, "/api/config").await).await;
  assert_eq!(config["parameters"]["input_size"], 640);

  let response = put_parameters(
    &app,
    json!({ "confidence_threshold": 0.5, "iou_threshold": 0.4, "input_size": 416 }),
  )
  .await;
  assert_eq!(response.status(), StatusCode::OK);
  let config = json_body(get(&app, "/api/config").await).await;
  assert_eq!(config["parameters"]["input_size"], 416);
}

#[tokio::test]
async fn run_reports_detections_and_serves_downloads() {
  let detector = Arc::new(ScriptedDetector::new(vec![
    Ok(detection(0, 0.91)),
    Ok(DetectResult::default()),
  ]));
  let app = app_with(detector.clone());

  assert_eq!(
    get(&app, "/api/results/1/image").await.status(),
    StatusCode::NOT_FOUND
  );

  upload(&app, &[png("A.png"), png("B.png")]).await;
  let response = run(&app).await;
  assert_eq!(response.status(), StatusCode::OK);
  let body = json_body(response).await;

  assert_eq!(detector.calls(), 2);
  assert_eq!(body["status"], "detections");
  assert_eq!(
    body["table"],
    json!([{ "image": "A.png", "defect": "hole", "probability": 0.91 }])
  );
  assert_eq!(body["images"][0]["download_url"], "/api/results/1/image");
  assert_eq!(body["images"][1]["detections"], json!([]));
  assert!(body["finished_at"].is_string());

  let download = get(&app, "/api/results/2/image").await;
  assert_eq!(download.status(), StatusCode::OK);
  assert_eq!(download.headers()[header::CONTENT_TYPE], "image/png");
  let disposition = download.headers()[header::CONTENT_DISPOSITION]
    .to_str()
    .unwrap()
    .to_string();
  assert!(disposition.starts_with("attachment; filename=\"prediction_2_B.png.png\""));
  let png = body_bytes(download).await;
  let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
  assert_eq!(decoded, cloth(32, 32));

  assert_eq!(
    get(&app, "/api/results/9/image").await.status(),
    StatusCode::NOT_FOUND
  );
}

#[tokio::test]
async fn new_upload_clears_previous_results() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));

  upload(&app, &[png("a.png")]).await;
  let body = json_body(run(&app).await).await;
  assert_eq!(body["status"], "no_defects");
  assert_eq!(
    body["message"],
    "No defects detected in all uploaded images."
  );
  assert_eq!(
    get(&app, "/api/results/1/image").await.status(),
    StatusCode::OK
  );

  upload(&app, &[png("b.png")]).await;
  assert_eq!(
    get(&app, "/api/results/1/image").await.status(),
    StatusCode::NOT_FOUND
  );
}

#[tokio::test]
async fn failed_images_are_listed_with_their_reason() {
  let app = app_with(Arc::new(ScriptedDetector::empty()));

  upload(&app, &[("broken.jpg", b"garbage".to_vec()), png("ok.png")]).await;
  let body = json_body(run(&app).await).await;

  assert_eq!(body["status"], "partial");
  assert_ne!(body["message"], "No defects detected in all uploaded images.");
  assert!(body["images"][0]["error"].is_string());
  assert!(body["images"][0].get("download_url").is_none());
  assert_eq!(body["images"][1]["download_url"], "/api/results/2/image");
}

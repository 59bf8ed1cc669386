// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/main.rs - Web 服务主程序
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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use url::Url;

use fabric_defect::{
  FromUrl,
  model::{Detector, ModelSlot, YoloOnnxBuilder},
  output::Draw,
  web::{HttpState, router},
};

/// 布匹瑕疵检测 Web 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 onnx:///models/best.onnx?labels=/models/labels.toml
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 标注文字使用的 TrueType 字体，缺省时查找系统字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 监听地址
  #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:8090")]
  pub listen: SocketAddr,
  /// 单次上传请求体上限（MB）
  #[arg(long, value_name = "MB", default_value_t = 64)]
  pub max_upload_mb: usize,
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("无法监听退出信号: {}", e);
  }
  info!("收到退出信号，正在关闭服务...");
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("监听地址: {}", args.listen);

  let model_url = args.model.clone();
  let slot = Arc::new(ModelSlot::new(move || {
    let model = YoloOnnxBuilder::from_url(&model_url)?.build()?;
    Ok(Arc::new(model) as Arc<dyn Detector>)
  }));

  // 启动时加载一次，之后所有请求复用
  let preload = slot.clone();
  let detector = tokio::task::spawn_blocking(move || preload.get())
    .await?
    .with_context(|| format!("无法加载模型 {}", args.model))?;
  info!("模型 {} 共 {} 个类别", detector.name(), detector.labels().len());

  let draw = Draw::load(args.font.as_deref()).context("无法加载字体")?;
  let state = HttpState::new(slot, Arc::new(draw));
  let app = router(state, args.max_upload_mb * 1024 * 1024);

  let listener = tokio::net::TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("无法监听 {}", args.listen))?;
  info!("服务已启动: http://{}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已停止");
  Ok(())
}

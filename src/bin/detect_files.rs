// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/bin/detect_files.rs - 命令行批量检测
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

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use url::Url;

use fabric_defect::{
  FromUrl,
  batch::{UploadBatch, UploadedImage},
  model::{DEFAULT_CONFIDENCE, DEFAULT_IOU, Detector, InferenceParameters, InputSize, YoloOnnxBuilder},
  output::{Annotator, Draw, PngExport},
  workflow::{DetectionWorkflow, ImageOutcome},
};

/// 对磁盘上的图片运行与 Web 页面相同的检测流程
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 onnx:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 标注图输出目录
  #[arg(long, value_name = "DIR")]
  pub output: PathBuf,
  /// 置信度阈值 [0.05, 0.95]
  #[arg(long, default_value_t = DEFAULT_CONFIDENCE)]
  pub confidence: f32,
  /// IoU 阈值 [0.10, 0.95]
  #[arg(long, default_value_t = DEFAULT_IOU)]
  pub iou: f32,
  /// 输入尺寸：640 / 512 / 416
  #[arg(long, default_value_t = 640)]
  pub imgsz: u32,
  /// 标注文字使用的 TrueType 字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 以 JSON 输出汇总表
  #[arg(long)]
  pub json: bool,
  /// 输入图片，最多处理前 5 张
  #[arg(required = true, value_name = "IMAGES")]
  pub images: Vec<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let params = InferenceParameters::new(args.confidence, args.iou, InputSize::try_from(args.imgsz)?)?;
  info!("模型地址: {}", args.model);
  info!("输出目录: {}", args.output.display());

  let mut uploads = Vec::with_capacity(args.images.len());
  for path in &args.images {
    let upload = UploadedImage::from_path(path)
      .with_context(|| format!("无法读取图片 {}", path.display()))?;
    if !upload.has_accepted_extension() {
      warn!("跳过不支持的文件: {}", path.display());
      continue;
    }
    uploads.push(upload);
  }
  let (batch, warning) = UploadBatch::validate(uploads);
  if let Some(warning) = &warning {
    eprintln!("{}", warning);
  }

  let model = YoloOnnxBuilder::from_url(&args.model)?
    .build()
    .with_context(|| format!("无法加载模型 {}", args.model))?;
  let draw = Draw::load(args.font.as_deref())?;

  let outcome = DetectionWorkflow::new(&model).run(&batch, &params);
  let export = PngExport::new(Annotator::new(&draw, model.labels()));

  let mut saved = Vec::new();
  for image_outcome in &outcome.outcomes {
    match image_outcome {
      ImageOutcome::Processed(report) => {
        let annotated = export.export_report(report)?;
        saved.push(annotated.save(&args.output)?);
      }
      ImageOutcome::Failed(failure) => {
        eprintln!("Image {} ({}) failed: {}", failure.index, failure.name, failure.reason);
      }
    }
  }

  let status = outcome.status();
  if args.json {
    let report = json!({
      "status": status,
      "message": status.message(),
      "warning": warning.map(|w| w.to_string()),
      "parameters": outcome.parameters,
      "outputs": saved,
      "table": outcome.table,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
  } else {
    println!("{}", status.message());
    if !outcome.table.is_empty() {
      print!("{}", outcome.table);
    }
  }

  Ok(())
}

// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/web/state.rs - Web 服务共享状态
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
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
  batch::{BatchWarning, UploadBatch},
  model::{InferenceParameters, ModelSlot},
  output::{AnnotatedImage, Draw},
  web::{ApiError, RunResponse},
};

/// 页面会话：当前上传、参数与最近一次运行结果，进程内只有一份
#[derive(Debug, Default)]
pub struct Session {
  pub batch: UploadBatch,
  pub warning: Option<BatchWarning>,
  pub parameters: InferenceParameters,
  pub last_run: Option<RunRecord>,
  /// 每次上传递增，运行结果只在批次未变化时保存
  pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
  pub response: RunResponse,
  pub images: BTreeMap<usize, AnnotatedImage>,
}

#[derive(Clone)]
pub struct HttpState {
  pub model: Arc<ModelSlot>,
  pub draw: Arc<Draw>,
  session: Arc<Mutex<Session>>,
}

impl HttpState {
  pub fn new(model: Arc<ModelSlot>, draw: Arc<Draw>) -> Self {
    Self {
      model,
      draw,
      session: Arc::new(Mutex::new(Session::default())),
    }
  }

  pub fn session(&self) -> Result<MutexGuard<'_, Session>, ApiError> {
    self.session.lock().map_err(|_| ApiError::Poisoned)
  }
}

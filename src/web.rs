// 该文件是 Fabric Defect （布匹瑕疵检测） 项目的一部分。
// src/web.rs - 单页面 Web 服务
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

use axum::{
  Router,
  extract::DefaultBodyLimit,
  routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

mod routes;
mod state;

pub use self::routes::{ApiError, ImageEntry, RunResponse};
pub use self::state::HttpState;

/// 每个用户操作对应一个处理函数
pub fn router(state: HttpState, max_upload_bytes: usize) -> Router {
  Router::new()
    .route("/", get(routes::index))
    .route("/api/config", get(routes::get_config))
    .route("/api/images", post(routes::upload_images))
    .route("/api/images/:index", get(routes::get_image))
    .route("/api/parameters", put(routes::set_parameters))
    .route("/api/run", post(routes::run_detection))
    .route("/api/results/:index/image", get(routes::download_result))
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

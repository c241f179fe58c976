//! Handler模块

use axum::{
    extract::{Extension, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use common::errors::AppError;
use common::middleware::RequestId;
use common::models::query::{ConnectionStateReport, QueryRequest, QueryResult};
use common::response::ApiResponse;
use crate::service::QueryService;
use crate::state::AppState;

const SERVICE_NAME: &str = "query-service";

/// 执行 SQL 查询
///
/// 引用的 schema 仍在加载时，请求会阻塞直到加载完成、加载失败或超时。
#[utoipa::path(
    post,
    path = "/api/query",
    tag = "query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "查询执行成功", body = ApiResponse<QueryResult>),
        (status = 400, description = "SQL 错误、关系不存在或校验错误"),
        (status = 502, description = "schema 所属连接加载失败"),
        (status = 503, description = "数据库不可用或服务正在关闭"),
        (status = 504, description = "等待 schema 加载超时")
    )
)]
pub async fn execute_query(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<ApiResponse<QueryResult>>, AppError> {
    let service = QueryService::new(state);
    let result = service.execute(req).await?;
    let duration_ms = result.execution_time_ms;

    Ok(Json(
        ApiResponse::ok_with_service(result, SERVICE_NAME)
            .with_request_id(request_id.as_str())
            .with_duration(duration_ms),
    ))
}

/// 获取连接加载状态
#[utoipa::path(
    get,
    path = "/api/connections/state",
    tag = "connections",
    responses(
        (status = 200, description = "当前连接状态", body = ApiResponse<ConnectionStateReport>),
        (status = 503, description = "数据库不可用")
    )
)]
pub async fn connection_state(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<ConnectionStateReport>>, AppError> {
    let report = QueryService::new(state).connection_state().await?;
    Ok(Json(
        ApiResponse::ok_with_service(report, SERVICE_NAME).with_request_id(request_id.as_str()),
    ))
}

/// 健康检查端点
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "health",
    responses(
        (status = 200, description = "服务运行正常", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.shutdown.is_cancelled() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status: status.to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

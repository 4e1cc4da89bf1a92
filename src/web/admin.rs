use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

/// 提供内嵌的控制台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 推流会话完整状态快照 API
pub async fn stream_status(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state
        .supervisor
        .snapshot()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(serde_json::to_value(snapshot).unwrap_or_default()))
}

/// 存活检查 API (供部署平台探活)
pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let streaming = state
        .supervisor
        .snapshot()
        .await
        .map(|s| s.running)
        .unwrap_or(false);
    Json(serde_json::json!({
        "status": "ok",
        "streaming": streaming,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// 操作员指令 API：start / stop / restart / rotate
pub async fn handle_control(
    State(state): State<SharedState>,
    Path(op): Path<String>,
) -> (StatusCode, String) {
    match op.as_str() {
        "start" => {
            state.supervisor.start();
            (StatusCode::OK, "Stream start requested".to_string())
        }
        "stop" => {
            state.supervisor.stop();
            (StatusCode::OK, "Stream stop requested".to_string())
        }
        "restart" => {
            state.supervisor.restart();
            (StatusCode::OK, "Stream restart requested".to_string())
        }
        "rotate" => {
            state.supervisor.rotate_source();
            (StatusCode::OK, "Source rotation requested".to_string())
        }
        other => (
            StatusCode::NOT_FOUND,
            format!("Unknown control operation: {}", other),
        ),
    }
}

/// 自动恢复开关 API：关闭后故障只上报不处理
pub async fn handle_auto_restart(
    State(state): State<SharedState>,
    Path(enabled): Path<String>,
) -> (StatusCode, String) {
    match enabled.as_str() {
        "on" => {
            state.supervisor.set_auto_restart(true);
            (StatusCode::OK, "Auto-restart enabled".to_string())
        }
        "off" => {
            state.supervisor.set_auto_restart(false);
            (StatusCode::OK, "Auto-restart disabled".to_string())
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("Expected 'on' or 'off', got: {}", other),
        ),
    }
}

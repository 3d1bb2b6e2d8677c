//! HTTP 请求处理器

use actix_web::{web, HttpResponse};
use chrono::Utc;
use std::sync::Arc;

use super::models::*;
use crate::observability::export_metrics;
use crate::replication::{Role, RoleManager};
use crate::storage::MemDb;
use crate::xds::SnapshotCache;

/// 应用状态
pub struct AppState {
    pub role_manager: Arc<RoleManager>,
    pub store: Arc<MemDb>,
    pub cache: Arc<SnapshotCache>,
}

impl AppState {
    /// 有角色，且从节点的接收器已启动
    pub fn readiness(&self) -> Readiness {
        let role = self.role_manager.get_role();
        let reason = match role {
            None => Some("no role assigned yet".to_string()),
            Some(Role::Slave) if !self.role_manager.configurator().receiver_started() => {
                Some("snapshot receiver not started".to_string())
            }
            _ => None,
        };
        Readiness {
            ready: reason.is_none(),
            role: role.map(|r| r.to_string()),
            reason,
        }
    }
}

/// 健康检查
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "meshgate",
        "timestamp": Utc::now().timestamp_millis()
    }))
}

/// 就绪检查
pub async fn readiness(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let readiness = state.readiness();
    if readiness.ready {
        HttpResponse::Ok().json(readiness)
    } else {
        HttpResponse::ServiceUnavailable().json(readiness)
    }
}

/// Prometheus 指标
pub async fn metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(export_metrics())
}

/// 节点状态
pub async fn node_status(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let manager = &state.role_manager;
    let status = NodeStatus {
        pod_id: manager.context().pod_id.clone(),
        role: manager.get_role().map(|r| r.to_string()),
        master: manager.node_info(),
        sender_started: manager.configurator().sender_started(),
        receiver_started: manager.configurator().receiver_started(),
        store_generation: state.store.generation(),
        node_groups: state.cache.node_groups(),
    };
    HttpResponse::Ok().json(ApiResponse::success(status))
}

/// 接收角色信号
pub async fn set_role(
    state: web::Data<Arc<AppState>>,
    req: web::Json<RoleRequest>,
) -> HttpResponse {
    let req = req.into_inner();
    let manager = &state.role_manager;
    let info = req
        .node
        .unwrap_or_else(|| manager.context().node.clone());

    match manager.apply_raw(info, &req.role).await {
        Ok(()) => HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
            "role": manager.get_role().map(|r| r.to_string()),
        }))),
        Err(e) => {
            log::error!("Failed to apply role {}: {}", req.role, e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error(500, e.to_string()))
        }
    }
}

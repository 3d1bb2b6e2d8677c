//! HTTP 路由配置

use super::handlers;
use actix_web::web;

/// 配置所有路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/ready", web::get().to(handlers::readiness))
        .route("/metrics", web::get().to(handlers::metrics))
        .route("/status", web::get().to(handlers::node_status))
        .route("/role", web::post().to(handlers::set_role));
}

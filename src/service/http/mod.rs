//! 运维 HTTP 服务
//!
//! 提供健康检查、就绪检查、Prometheus 指标和角色信号入口

pub mod handlers;
pub mod models;
pub mod routes;

use actix_web::{middleware, web, App, HttpServer as ActixHttpServer};
use std::io;
use std::sync::Arc;

pub use handlers::AppState;

/// HTTP 服务器
pub struct HttpServer {
    app_state: Arc<AppState>,

    /// 监听地址
    bind_address: String,
}

impl HttpServer {
    pub fn new(app_state: Arc<AppState>, bind_address: String) -> Self {
        Self {
            app_state,
            bind_address,
        }
    }

    /// 启动 HTTP 服务器
    pub async fn run(self) -> io::Result<()> {
        log::info!("Starting HTTP server at {}", self.bind_address);

        let app_state = self.app_state.clone();
        ActixHttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .wrap(middleware::Logger::default())
                .configure(routes::configure)
        })
        .bind(&self.bind_address)?
        .run()
        .await
    }
}

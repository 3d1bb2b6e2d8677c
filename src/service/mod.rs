//! 服务层
//!
//! - `config_service`: 配置写入入口（事务 + 版本递增 + 事件发布）
//! - `http`: 运维 HTTP 端点（health / ready / metrics / role）

pub mod config_service;
pub mod http;

pub use config_service::ConfigService;
pub use http::HttpServer;

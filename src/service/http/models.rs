//! HTTP 数据模型

use serde::{Deserialize, Serialize};

use crate::replication::NodeInfo;

/// 通用 API 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// API 错误
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u32,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: u32, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError { code, message }),
        }
    }
}

/// 角色信号
///
/// `node` 是主节点的地址信息；为空时使用本节点自身的信息。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRequest {
    pub role: String,
    #[serde(default)]
    pub node: Option<NodeInfo>,
}

/// 节点状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub pod_id: String,
    pub role: Option<String>,
    pub master: Option<NodeInfo>,
    pub sender_started: bool,
    pub receiver_started: bool,
    pub store_generation: u64,
    pub node_groups: Vec<String>,
}

/// 就绪检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub ready: bool,
    pub role: Option<String>,
    pub reason: Option<String>,
}

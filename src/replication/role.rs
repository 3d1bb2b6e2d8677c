//! 节点角色管理

use super::configurator::Configurator;
use crate::observability::NODE_ROLE;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 节点角色（由集群成员管理模块给出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 主节点（接受写入，向从节点广播快照）
    Master,

    /// 从节点（只读，应用主节点的快照）
    Slave,

    /// 未加入法定人数：既不发送也不接收
    Phantom,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Phantom => "phantom",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            Role::Phantom => 0,
            Role::Slave => 1,
            Role::Master => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            "phantom" => Ok(Role::Phantom),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// 节点网络信息
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub ip: String,
    pub swim_port: u16,
    pub bus_port: u16,
    pub http_port: u16,
}

impl NodeInfo {
    /// 复制总线地址 `ip:bus_port`
    pub fn bus_address(&self) -> String {
        format!("{}:{}", self.ip, self.bus_port)
    }
}

/// 启动时构建一次、随构造函数传递的节点上下文
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub pod_id: String,
    pub tls_mode: String,
    pub node: NodeInfo,
}

impl NodeContext {
    pub fn new(pod_id: impl Into<String>, tls_mode: impl Into<String>, node: NodeInfo) -> Self {
        Self {
            pod_id: pod_id.into(),
            tls_mode: tls_mode.into(),
            node,
        }
    }
}

/// 只读角色视图
pub trait RoleView: Send + Sync {
    /// 尚未收到角色时返回 None
    fn current_role(&self) -> Option<Role>;
}

impl RoleView for Role {
    fn current_role(&self) -> Option<Role> {
        Some(*self)
    }
}

/// 角色管理器
///
/// 记录当前 (NodeInfo, Role)，每次 apply 都交给 Configurator 调整通信；
/// 进入 Phantom 时额外调用 `Configurator::isolate()`。
pub struct RoleManager {
    context: NodeContext,
    current: RwLock<Option<(NodeInfo, Role)>>,
    configurator: Arc<Configurator>,

    /// 串行化角色切换
    apply_lock: tokio::sync::Mutex<()>,
}

impl RoleManager {
    pub fn new(context: NodeContext, configurator: Arc<Configurator>) -> Self {
        Self {
            context,
            current: RwLock::new(None),
            configurator,
            apply_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn configurator(&self) -> &Arc<Configurator> {
        &self.configurator
    }

    pub fn get_role(&self) -> Option<Role> {
        self.current.read().as_ref().map(|(_, r)| *r)
    }

    pub fn node_info(&self) -> Option<NodeInfo> {
        self.current.read().as_ref().map(|(i, _)| i.clone())
    }

    pub fn is_master(&self) -> bool {
        self.get_role() == Some(Role::Master)
    }

    /// 应用成员管理模块给出的角色
    pub async fn apply(&self, info: NodeInfo, role: Role) -> Result<(), super::ReplicationError> {
        let _guard = self.apply_lock.lock().await;

        let previous = self.get_role();
        match previous {
            Some(old) if old != role => {
                log::info!("[{}] Role changed: {} -> {}", self.context.pod_id, old, role)
            }
            None => log::info!("[{}] Initial role: {}", self.context.pod_id, role),
            _ => log::debug!("[{}] Role unchanged: {}", self.context.pod_id, role),
        }

        *self.current.write() = Some((info.clone(), role));
        NODE_ROLE
            .with_label_values(&[self.context.pod_id.as_str()])
            .set(role.gauge_value());

        if role == Role::Phantom {
            self.configurator.isolate().await;
        }
        self.configurator.set_up_nodes_communication(&info, role).await
    }

    /// 以字符串形式接收角色；无法识别的角色记录日志后忽略
    pub async fn apply_raw(&self, info: NodeInfo, role: &str) -> Result<(), super::ReplicationError> {
        match role.parse::<Role>() {
            Ok(role) => self.apply(info, role).await,
            Err(e) => {
                log::warn!("[{}] Ignoring role transition: {}", self.context.pod_id, e);
                Ok(())
            }
        }
    }
}

impl RoleView for RoleManager {
    fn current_role(&self) -> Option<Role> {
        self.get_role()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("MASTER".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("slave".parse::<Role>().unwrap(), Role::Slave);
        assert!("candidate".parse::<Role>().is_err());
    }

    #[test]
    fn test_bus_address() {
        let info = NodeInfo {
            ip: "10.1.2.3".to_string(),
            swim_port: 7946,
            bus_port: 5555,
            http_port: 8080,
        };
        assert_eq!(info.bus_address(), "10.1.2.3:5555");
    }

    #[test]
    fn test_role_view_for_fixed_role() {
        assert_eq!(Role::Slave.current_role(), Some(Role::Slave));
    }
}

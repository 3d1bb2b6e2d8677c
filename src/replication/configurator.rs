//! 节点通信配置器
//!
//! 根据集群角色启停快照发送器/接收器：
//! - Master: 停接收器，启发送器
//! - Slave: 停发送器，（重新）启动接收器指向新的主节点总线地址
//! - Phantom: 不做任何事；停掉两侧由 `isolate()` 完成
//!
//! 同一角色重复调用是幂等的。

use super::role::{NodeInfo, Role};
use super::ReplicationError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SenderControl: Send + Sync {
    fn is_started(&self) -> bool;

    async fn start_sending(&self, info: &NodeInfo) -> Result<(), ReplicationError>;

    async fn stop_sending(&self) -> Result<(), ReplicationError>;
}

#[async_trait]
pub trait ReceiverControl: Send + Sync {
    fn is_started(&self) -> bool;

    async fn start_receiving(&self, bus_address: &str) -> Result<(), ReplicationError>;

    async fn stop_receiving(&self) -> Result<(), ReplicationError>;
}

/// 节点通信配置器
pub struct Configurator {
    sender: Arc<dyn SenderControl>,
    receiver: Arc<dyn ReceiverControl>,
}

impl Configurator {
    pub fn new(sender: Arc<dyn SenderControl>, receiver: Arc<dyn ReceiverControl>) -> Self {
        Self { sender, receiver }
    }

    pub fn sender_started(&self) -> bool {
        self.sender.is_started()
    }

    pub fn receiver_started(&self) -> bool {
        self.receiver.is_started()
    }

    pub async fn set_up_nodes_communication(
        &self,
        info: &NodeInfo,
        role: Role,
    ) -> Result<(), ReplicationError> {
        match role {
            Role::Slave => {
                if self.sender.is_started() {
                    if let Err(e) = self.sender.stop_sending().await {
                        log::error!("Failed to stop sender while becoming slave: {}", e);
                    }
                }
                // 主节点可能已变更，总是重新连接
                if self.receiver.is_started() {
                    if let Err(e) = self.receiver.stop_receiving().await {
                        log::error!("Failed to stop receiver before reconnecting: {}", e);
                    }
                }
                self.receiver.start_receiving(&info.bus_address()).await
            }
            Role::Master => {
                if self.receiver.is_started() {
                    if let Err(e) = self.receiver.stop_receiving().await {
                        log::error!("Failed to stop receiver while becoming master: {}", e);
                    }
                }
                if !self.sender.is_started() {
                    self.sender.start_sending(info).await?;
                }
                Ok(())
            }
            Role::Phantom => {
                log::debug!("Phantom role, leaving node communication unchanged");
                Ok(())
            }
        }
    }

    /// 停掉正在运行的发送器和接收器（节点失去法定人数时）
    pub async fn isolate(&self) {
        if self.sender.is_started() {
            if let Err(e) = self.sender.stop_sending().await {
                log::error!("Failed to stop sender while isolating: {}", e);
            }
        }
        if self.receiver.is_started() {
            if let Err(e) = self.receiver.stop_receiving().await {
                log::error!("Failed to stop receiver while isolating: {}", e);
            }
        }
    }
}

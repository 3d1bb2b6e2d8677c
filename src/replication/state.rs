//! 发送器/接收器状态机
//!
//! ```text
//!            BeginStart             StartSucceeded
//! Stopped ---------------> Starting ---------------> Started
//!    ^                        |                         |
//!    |       StartFailed      |                         |
//!    +------------------------+                         |
//!    |                      Stop                        |
//!    +--------------------------------------------------+
//! ```

use super::ReplicationError;
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Starting,
    Started,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Stopped => "stopped",
            LoopState::Starting => "starting",
            LoopState::Started => "started",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTransition {
    BeginStart,
    StartSucceeded,
    StartFailed,
    Stop,
}

/// 状态转移表
pub fn next_state(from: LoopState, transition: LoopTransition) -> Option<LoopState> {
    use LoopState::*;
    use LoopTransition::*;
    match (from, transition) {
        (Stopped, BeginStart) => Some(Starting),
        (Starting, StartSucceeded) => Some(Started),
        (Starting, StartFailed) => Some(Stopped),
        (Started, Stop) => Some(Stopped),
        _ => None,
    }
}

/// 线程安全的状态单元
#[derive(Debug)]
pub struct StateCell {
    name: &'static str,
    state: Mutex<LoopState>,
}

impl StateCell {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LoopState::Stopped),
        }
    }

    pub fn get(&self) -> LoopState {
        *self.state.lock()
    }

    pub fn is_started(&self) -> bool {
        self.get() == LoopState::Started
    }

    /// 执行转移；非法转移返回错误，状态不变
    pub fn apply(&self, transition: LoopTransition) -> Result<LoopState, ReplicationError> {
        let mut state = self.state.lock();
        match next_state(*state, transition) {
            Some(next) => {
                log::debug!("{} state: {} -> {}", self.name, *state, next);
                *state = next;
                Ok(next)
            }
            None => Err(ReplicationError::InvalidTransition {
                component: self.name,
                from: *state,
                transition,
            }),
        }
    }
}

//! 变更事件与内部事件总线
//!
//! - `event`: 四类事件与主题
//! - `factory`: Change 列表 -> 事件
//! - `bus`: 同步发布/订阅

pub mod bus;
pub mod event;
pub mod factory;

pub use bus::{BusError, BusStatsSnapshot, EventBus, EventHandler};
pub use event::{
    ChangeEvent, ChangeMap, Event, MultipleChangeEvent, PartialReloadEvent, ReloadEvent, Topic,
};
pub use factory::{changes_to_map, node_groups_of};

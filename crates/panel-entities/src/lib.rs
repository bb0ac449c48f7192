//! Entity-модели панели управления узлами.

pub mod enums;
pub mod node_assignments;
pub mod node_group_members;
pub mod node_groups;
pub mod node_installs;
pub mod node_tokens;
pub mod nodes;

pub use enums::{GroupStrategy, NodeStatus, SyncStatus};

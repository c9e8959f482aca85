//! Cluster-wide mechanics used by the CRM.
//!
//! This module bundles:
//! - Node status tracking with fence delay
//! - Fence orchestration (watchdog and hardware modes)
//! - Node usage accounting for the placement scheduler
//! - The placement decision itself

mod fence;
mod node_status;
mod placement;
mod usage;

pub use fence::FenceRunner;
pub use node_status::NodeStatusTracker;
pub use placement::{select_service_node, SelectPreference};
pub use usage::{usage_for_mode, NodeUsage, UsageBasic, UsageStatic};

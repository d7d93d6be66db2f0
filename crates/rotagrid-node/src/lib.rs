//! rotagrid-node — the rebalance protocol and the `Node` façade.
//!
//! Redistributes a shared list of payloads across the members of a view
//! whenever membership changes, so that every item runs on exactly one
//! node and no item starts anywhere before it stopped everywhere.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── SharedState (canonical list + confirmation barrier)
//!   ├── LifecycleHandler (local running set, every node)
//!   ├── OperabilityGate (|view| >= quorum)
//!   ├── RebalanceCoordinator (leader only)
//!   │     └── worker task, fed by a coalescing RebalanceTrigger
//!   └── event loop (view + role changes)
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod handler;
pub mod listener;
pub mod node;
pub mod plan;

pub use config::NodeConfig;
pub use coordinator::{RebalanceCoordinator, RebalanceReport, RebalanceTrigger};
pub use error::{NodeError, NodeResult, RebalanceError};
pub use gate::OperabilityGate;
pub use handler::LifecycleHandler;
pub use listener::{Listeners, StartListener, StopListener};
pub use node::{Node, NodeStatus};
pub use plan::{round_robin, AssignmentPlan, AssignmentStrategy, RoundRobin, RoundRobinStrategy};

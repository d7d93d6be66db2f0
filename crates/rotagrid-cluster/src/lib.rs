//! rotagrid-cluster — the collaborators a rebalancing node talks to.
//!
//! A node needs three things from its environment: a `Transport` that
//! delivers commands point-to-point, a `Membership` source of views,
//! and a `Leadership` component that says who orchestrates. This crate
//! defines those seams and ships two implementations.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── Transport ──────── LocalTransport  (in-process, tests / simulate)
//!   │                 └── GrpcTransport   (feature "grpc")
//!   ├── Membership ─────── LocalMembership (join-ordered views)
//!   │                 └── HeartbeatMembership (feature "grpc", ping heartbeats)
//!   └── Leadership ─────── CoordinatorLeadership
//!                            leader = coordinator of a majority view
//! ```

pub mod command;
pub mod local;
pub mod membership;
pub mod transport;

#[cfg(feature = "grpc")]
pub mod grpc;

pub use command::Command;
pub use local::{Delivery, LocalCluster, LocalMembership, LocalTransport};
pub use membership::{majority, CoordinatorLeadership, Leadership, Membership, Role};
pub use transport::{CommandHandler, Transport, TransportError, TransportResult};

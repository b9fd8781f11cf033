//! # collab-core
//!
//! The distribution core of the collab session broker.
//!
//! - **ConnectionManager** - lifecycle, enqueue, removal and introspection
//! - **DispatchQueue** - ordered hand-off from connections to the dispatch loop
//! - **ProjectDirectory** - which clients belong to which project
//! - **UserRegistry** - uid to identity and permission masks
//! - **Packet** / **Payload** - one update and its shared structured body
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ enqueue ┌───────────────┐ dequeue ┌───────────────┐
//! │ Connection  │────────▶│ DispatchQueue │────────▶│ Dispatch loop │
//! └─────────────┘         └───────────────┘         └───────────────┘
//!        ▲                                                  │ loop_project
//!        │ post / send_data                                 ▼
//!        └───────────────────────────────────────── ┌──────────────────┐
//!                                                   │ ProjectDirectory │
//!                                                   └──────────────────┘
//! ```
//!
//! A single dispatch loop drains one FIFO queue, so every member of a
//! project sees that project's updates in the same order.

pub mod client;
pub mod directory;
pub mod dispatch;
pub mod manager;
pub mod packet;
pub mod payload;
pub mod queue;
pub mod user;

pub use client::{Client, ClientError, ClientHandle, ClientId, ClientOutbox, Outbound, ProjectId};
pub use directory::{ProjectDirectory, ProjectMap, Visitor};
pub use dispatch::{dispatch, DispatchOutcome, DispatchSnapshot, DispatchStats};
pub use manager::{ConnectionManager, ManagerConfig, ManagerError, ManagerState, LISTING_HEADER};
pub use packet::{Packet, UPDATE_ID_FIELD};
pub use payload::{Payload, PayloadError, SharedPayload};
pub use queue::{DispatchQueue, QueueError};
pub use user::{UserInfo, UserRegistry, INVALID_UID};

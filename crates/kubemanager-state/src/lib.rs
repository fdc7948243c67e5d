//! kubemanager-state — embedded state store for KubeManager.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for projects, roles, memberships, workloads and saga execution
//! records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Membership keys are composite (`{project_id}:{user_id}`) so a project's
//! members can be found by prefix scan. Multi-row writes (project + owner
//! membership, cascading project deletion) happen inside a single write
//! transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;

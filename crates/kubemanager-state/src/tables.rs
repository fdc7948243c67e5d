//! redb table definitions for the KubeManager state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types),
//! except the name index and cancel table whose values are plain strings / timestamps.

use redb::TableDefinition;

/// Projects keyed by project id.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Unique project names: name → project id.
pub const PROJECT_NAMES: TableDefinition<&str, &str> = TableDefinition::new("project_names");

/// Roles keyed by role name.
pub const ROLES: TableDefinition<&str, &[u8]> = TableDefinition::new("roles");

/// Project memberships keyed by `{project_id}:{user_id}`.
pub const MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("members");

/// Workloads keyed by workload id.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Saga execution records keyed by saga id.
pub const SAGAS: TableDefinition<&str, &[u8]> = TableDefinition::new("sagas");

/// Pending cancel requests: saga id → unix timestamp of the request.
pub const SAGA_CANCELS: TableDefinition<&str, u64> = TableDefinition::new("saga_cancels");

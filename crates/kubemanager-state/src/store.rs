//! StateStore — redb-backed state persistence for KubeManager.
//!
//! Provides typed operations over projects, roles, memberships, workloads
//! and saga records. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing and the in-memory cluster mode).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        txn.open_table(PROJECT_NAMES).map_err(map_err!(Table))?;
        txn.open_table(ROLES).map_err(map_err!(Table))?;
        txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(SAGAS).map_err(map_err!(Table))?;
        txn.open_table(SAGA_CANCELS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON table helpers ─────────────────────────────────

    fn put_json<T: Serialize>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        mut keep: impl FnMut(&str, &T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let item: T = decode(value.value())?;
            if keep(key.value(), &item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove_key(&self, def: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Insert a project and its owner membership in a single transaction.
    ///
    /// Re-running with the same project id is a no-op for the project row,
    /// so a retried step converges. A different project already holding the
    /// name yields `Conflict`; a missing role yields `NotFound`.
    pub fn create_project_with_owner(
        &self,
        project: &Project,
        owner_id: &Uuid,
        role_name: &str,
    ) -> StateResult<ProjectMember> {
        let id = project.id.to_string();
        let project_bytes = encode(project)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let member;
        {
            let mut projects = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            let mut names = txn.open_table(PROJECT_NAMES).map_err(map_err!(Table))?;
            let roles = txn.open_table(ROLES).map_err(map_err!(Table))?;
            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;

            let holder = names
                .get(project.name.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            if let Some(other) = holder
                && other != id
            {
                return Err(StateError::Conflict(format!(
                    "project name '{}' already exists",
                    project.name
                )));
            }

            let role: Role = match roles.get(role_name).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("role {role_name}"))),
            };

            let exists = projects
                .get(id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                projects
                    .insert(id.as_str(), project_bytes.as_slice())
                    .map_err(map_err!(Write))?;
                names
                    .insert(project.name.as_str(), id.as_str())
                    .map_err(map_err!(Write))?;
            }

            member = ProjectMember {
                project_id: project.id,
                user_id: *owner_id,
                role_id: role.id,
                joined_at: epoch_secs(),
            };
            let member_bytes = encode(&member)?;
            members
                .insert(member.table_key().as_str(), member_bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(project = %project.id, name = %project.name, "project stored with owner");
        Ok(member)
    }

    pub fn get_project(&self, id: &Uuid) -> StateResult<Option<Project>> {
        self.get_json(PROJECTS, &id.to_string())
    }

    /// Look up a project through the unique-name index.
    pub fn get_project_by_name(&self, name: &str) -> StateResult<Option<Project>> {
        let id = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(PROJECT_NAMES).map_err(map_err!(Table))?;
            table
                .get(name)
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string())
        };
        match id {
            Some(id) => self.get_json(PROJECTS, &id),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> StateResult<Vec<Project>> {
        let mut projects: Vec<Project> = self.scan_json(PROJECTS, |_, _| true)?;
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Set a project's status and phase. Returns the updated row.
    pub fn update_project_status(
        &self,
        id: &Uuid,
        status: ProjectStatus,
        phase: &str,
    ) -> StateResult<Project> {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let project;
        {
            let mut table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_vec());
            let Some(bytes) = current else {
                return Err(StateError::NotFound(format!("project {id}")));
            };
            let mut updated: Project = decode(&bytes)?;
            updated.status = status;
            updated.current_phase = phase.to_string();
            updated.updated_at = epoch_secs();
            let bytes = encode(&updated)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            project = updated;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(project = %id, %status, phase, "project status updated");
        Ok(project)
    }

    /// Delete a project together with its name index entry, memberships
    /// and workload rows. Returns true if the project existed.
    pub fn delete_project(&self, id: &Uuid) -> StateResult<bool> {
        let key = id.to_string();
        let member_prefix = format!("{key}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let removed_members;
        let removed_workloads;
        {
            let mut projects = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            let mut names = txn.open_table(PROJECT_NAMES).map_err(map_err!(Table))?;
            let mut members = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            let mut workloads = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;

            let removed = projects
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .map(|g| g.value().to_vec());
            existed = removed.is_some();
            if let Some(bytes) = removed {
                let project: Project = decode(&bytes)?;
                names
                    .remove(project.name.as_str())
                    .map_err(map_err!(Write))?;
            }

            let member_keys: Vec<String> = members
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (k, _) = entry.ok()?;
                    let k = k.value().to_string();
                    k.starts_with(&member_prefix).then_some(k)
                })
                .collect();
            for k in &member_keys {
                members.remove(k.as_str()).map_err(map_err!(Write))?;
            }
            removed_members = member_keys.len();

            let mut workload_keys = Vec::new();
            for entry in workloads.iter().map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                let workload: Workload = decode(v.value())?;
                if workload.project_id == *id {
                    workload_keys.push(k.value().to_string());
                }
            }
            for k in &workload_keys {
                workloads.remove(k.as_str()).map_err(map_err!(Write))?;
            }
            removed_workloads = workload_keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            project = %id,
            existed,
            removed_members,
            removed_workloads,
            "project deleted"
        );
        Ok(existed)
    }

    // ── Roles & members ────────────────────────────────────────────

    /// Insert the built-in roles if missing. Existing role ids are kept.
    pub fn seed_default_roles(&self) -> StateResult<Vec<Role>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut roles = Vec::with_capacity(DEFAULT_ROLES.len());
        {
            let mut table = txn.open_table(ROLES).map_err(map_err!(Table))?;
            for name in DEFAULT_ROLES {
                let existing = table
                    .get(name)
                    .map_err(map_err!(Read))?
                    .map(|g| g.value().to_vec());
                let role = match existing {
                    Some(bytes) => decode(&bytes)?,
                    None => {
                        let role = Role {
                            id: Uuid::new_v4(),
                            name: name.to_string(),
                        };
                        let bytes = encode(&role)?;
                        table
                            .insert(name, bytes.as_slice())
                            .map_err(map_err!(Write))?;
                        role
                    }
                };
                roles.push(role);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = roles.len(), "default roles seeded");
        Ok(roles)
    }

    pub fn get_role_by_name(&self, name: &str) -> StateResult<Option<Role>> {
        self.get_json(ROLES, name)
    }

    /// Insert or replace a membership.
    pub fn upsert_member(&self, member: &ProjectMember) -> StateResult<()> {
        self.put_json(MEMBERS, &member.table_key(), member)
    }

    pub fn get_member(&self, project_id: &Uuid, user_id: &Uuid) -> StateResult<Option<ProjectMember>> {
        self.get_json(MEMBERS, &member_key(project_id, user_id))
    }

    /// All memberships of a project (prefix scan over composite keys).
    pub fn list_members(&self, project_id: &Uuid) -> StateResult<Vec<ProjectMember>> {
        let prefix = format!("{project_id}:");
        self.scan_json(MEMBERS, |key, _: &ProjectMember| key.starts_with(&prefix))
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert a new workload row.
    ///
    /// Workload names are unique within a project; the check and the insert
    /// share one write transaction. An existing id also yields `Conflict`.
    pub fn insert_workload(&self, workload: &Workload) -> StateResult<()> {
        let key = workload.id.to_string();
        let bytes = encode(workload)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("workload {key} already exists")));
            }
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let other: Workload = decode(value.value())?;
                if other.project_id == workload.project_id && other.name == workload.name {
                    return Err(StateError::Conflict(format!(
                        "workload name '{}' already exists in project {}",
                        workload.name, workload.project_id
                    )));
                }
            }
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload = %workload.id, status = %workload.status, "workload stored");
        Ok(())
    }

    pub fn get_workload(&self, id: &Uuid) -> StateResult<Option<Workload>> {
        self.get_json(WORKLOADS, &id.to_string())
    }

    pub fn list_workloads_for_project(&self, project_id: &Uuid) -> StateResult<Vec<Workload>> {
        let mut workloads =
            self.scan_json(WORKLOADS, |_, w: &Workload| w.project_id == *project_id)?;
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    /// Apply `change` to an existing workload inside one write transaction
    /// and return the stored row.
    ///
    /// A missing row yields `NotFound` and nothing is written. An error from
    /// `change` aborts the transaction.
    pub fn modify_workload<F>(&self, id: &Uuid, change: F) -> StateResult<Workload>
    where
        F: FnOnce(&mut Workload) -> StateResult<()>,
    {
        let key = id.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let workload;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_vec());
            let Some(bytes) = current else {
                return Err(StateError::NotFound(format!("workload {id}")));
            };
            let mut updated: Workload = decode(&bytes)?;
            change(&mut updated)?;
            updated.id = *id;
            updated.updated_at = epoch_secs();
            let bytes = encode(&updated)?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            workload = updated;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workload = %id, status = %workload.status, phase = %workload.current_phase, "workload updated");
        Ok(workload)
    }

    /// Set a workload's status and phase. Returns the updated row.
    pub fn update_workload_status(
        &self,
        id: &Uuid,
        status: WorkloadStatus,
        phase: &str,
    ) -> StateResult<Workload> {
        self.modify_workload(id, |workload| {
            workload.status = status;
            workload.current_phase = phase.to_string();
            Ok(())
        })
    }

    pub fn delete_workload(&self, id: &Uuid) -> StateResult<bool> {
        let existed = self.remove_key(WORKLOADS, &id.to_string())?;
        debug!(workload = %id, existed, "workload deleted");
        Ok(existed)
    }

    // ── Sagas ──────────────────────────────────────────────────────

    pub fn put_saga(&self, record: &SagaRecord) -> StateResult<()> {
        self.put_json(SAGAS, &record.id, record)
    }

    pub fn get_saga(&self, id: &str) -> StateResult<Option<SagaRecord>> {
        self.get_json(SAGAS, id)
    }

    /// Sagas left in `Running` or `Compensating`, oldest first.
    pub fn list_incomplete_sagas(&self) -> StateResult<Vec<SagaRecord>> {
        let mut sagas = self.scan_json(SAGAS, |_, s: &SagaRecord| !s.status.is_terminal())?;
        sagas.sort_by_key(|s| s.created_at);
        Ok(sagas)
    }

    /// Record a cancel request for a non-terminal saga.
    /// Returns false when the saga is unknown or already finished.
    pub fn request_saga_cancel(&self, id: &str) -> StateResult<bool> {
        match self.get_saga(id)? {
            Some(record) if !record.status.is_terminal() => {}
            _ => return Ok(false),
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SAGA_CANCELS).map_err(map_err!(Table))?;
            table.insert(id, epoch_secs()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(saga_id = %id, "saga cancel requested");
        Ok(true)
    }

    pub fn saga_cancel_requested(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SAGA_CANCELS).map_err(map_err!(Table))?;
        Ok(table.get(id).map_err(map_err!(Read))?.is_some())
    }

    /// Drop a cancel marker once the saga has reached a terminal state.
    pub fn clear_saga_cancel(&self, id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SAGA_CANCELS).map_err(map_err!(Table))?;
            table.remove(id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

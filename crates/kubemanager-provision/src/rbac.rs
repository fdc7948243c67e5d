//! RBAC collaborator: binds users to named roles on a project.

use async_trait::async_trait;
use kubemanager_state::{ProjectMember, StateError, StateStore, epoch_secs};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ProvisionError, ProvisionResult};

/// Role assignment scoped to a project. Assigning the same role twice is
/// a no-op.
#[async_trait]
pub trait RbacService: Send + Sync {
    async fn assign_role(
        &self,
        project_id: &Uuid,
        user_id: &Uuid,
        role_name: &str,
    ) -> ProvisionResult<ProjectMember>;
}

/// Membership rows in the state store.
#[derive(Clone)]
pub struct StoreRbac {
    store: StateStore,
}

impl StoreRbac {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RbacService for StoreRbac {
    async fn assign_role(
        &self,
        project_id: &Uuid,
        user_id: &Uuid,
        role_name: &str,
    ) -> ProvisionResult<ProjectMember> {
        let role = self
            .store
            .get_role_by_name(role_name)?
            .ok_or_else(|| StateError::NotFound(format!("role {role_name}")))?;
        if self.store.get_project(project_id)?.is_none() {
            return Err(ProvisionError::NotFound(format!("project {project_id}")));
        }

        if let Some(existing) = self.store.get_member(project_id, user_id)?
            && existing.role_id == role.id
        {
            return Ok(existing);
        }

        let member = ProjectMember {
            project_id: *project_id,
            user_id: *user_id,
            role_id: role.id,
            joined_at: epoch_secs(),
        };
        self.store.upsert_member(&member)?;
        debug!(project_id = %project_id, user_id = %user_id, role = role_name, "role assigned");
        Ok(member)
    }
}

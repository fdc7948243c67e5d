//! Quota accounting.
//!
//! Reservations are computed in exact units (millicores, bytes) so that a
//! request is never rounded below what it asks for. The coarse Mi/Gi views
//! exist only for reporting.

use std::fmt;

use kubemanager_core::CoreResult;
use kubemanager_core::quantity::{self, GIB, MIB};
use kubemanager_state::{Project, StateStore, Workload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionResult;

/// A project-level amount of CPU, memory and storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_milli: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

impl ResourceUsage {
    /// Reservation of one workload shape: limit × max(replicas, 1), plus
    /// storage when persistence is enabled.
    pub fn for_workload(
        cpu_limit: &str,
        memory_limit: &str,
        storage_size: &str,
        persistence_enabled: bool,
        replicas: i32,
    ) -> CoreResult<Self> {
        let replicas = replicas.max(1) as u64;
        let storage_bytes = if persistence_enabled {
            quantity::bytes(storage_size)?
        } else {
            0
        };
        Ok(Self {
            cpu_milli: quantity::cpu_millis(cpu_limit)?.saturating_mul(replicas),
            memory_bytes: quantity::bytes(memory_limit)?.saturating_mul(replicas),
            storage_bytes,
        })
    }

    pub fn of_workload(workload: &Workload) -> CoreResult<Self> {
        Self::for_workload(
            &workload.cpu_limit,
            &workload.memory_limit,
            &workload.storage_size,
            workload.persistence_enabled,
            workload.replicas,
        )
    }

    /// The envelope a project was created with.
    pub fn limits_of(project: &Project) -> CoreResult<Self> {
        Ok(Self {
            cpu_milli: quantity::cpu_millis(&project.cpu_limit)?,
            memory_bytes: quantity::bytes(&project.memory_limit)?,
            storage_bytes: quantity::bytes(&project.storage_limit)?,
        })
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            cpu_milli: self.cpu_milli.saturating_add(other.cpu_milli),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            storage_bytes: self.storage_bytes.saturating_add(other.storage_bytes),
        }
    }

    /// Memory in whole MiB (truncated).
    pub fn memory_mi(&self) -> u64 {
        self.memory_bytes / MIB
    }

    /// Storage in whole GiB (truncated).
    pub fn storage_gi(&self) -> u64 {
        self.storage_bytes / GIB
    }
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m memory={}Mi storage={}Gi",
            self.cpu_milli,
            self.memory_mi(),
            self.storage_gi()
        )
    }
}

/// Sums the reservations of a project's live workloads.
#[derive(Clone)]
pub struct QuotaAccountant {
    store: StateStore,
}

impl QuotaAccountant {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Aggregate reservation of every workload not FAILED or DELETED.
    /// A malformed quantity on any workload is an error, never zero.
    pub fn total_usage(&self, project_id: &Uuid) -> ProvisionResult<ResourceUsage> {
        self.total_usage_excluding(project_id, None)
    }

    /// Same as [`QuotaAccountant::total_usage`], leaving out one workload
    /// (the one being resized).
    pub fn total_usage_excluding(
        &self,
        project_id: &Uuid,
        exclude: Option<&Uuid>,
    ) -> ProvisionResult<ResourceUsage> {
        let mut total = ResourceUsage::default();
        for workload in self.store.list_workloads_for_project(project_id)? {
            if !workload.counts_toward_quota() || Some(&workload.id) == exclude {
                continue;
            }
            total = total.saturating_add(ResourceUsage::of_workload(&workload)?);
        }
        Ok(total)
    }
}

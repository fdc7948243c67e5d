//! Provisioner — the entry point for every project and workload operation.
//!
//! Launching operations validate their input, run admission where needed,
//! start a saga on a background task and return straight away with the
//! saga id. Callers poll [`Provisioner::get_status`],
//! [`Provisioner::get_workload`] or [`Provisioner::saga_status`].

use std::sync::Arc;
use std::time::Duration;

use kubemanager_cluster::{ClusterProvisioner, HelmInstaller};
use kubemanager_core::config::{KubeManagerConfig, ProjectDefaults};
use kubemanager_core::naming::{namespace_for, validate_name};
use kubemanager_core::quantity::{self, format_mebibytes, format_millicores};
use kubemanager_core::ImageRef;
use kubemanager_saga::{
    SagaContext, SagaDefinition, SagaEngine, SagaOutcome, SagaResult, StepProfiles,
};
use kubemanager_state::{
    Project, ProjectPhase, ProjectStatus, SagaRecord, StateError, StateResult, StateStore, Workload,
    WorkloadPhase, WorkloadStatus, epoch_secs,
};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::error::{ProvisionError, ProvisionResult};
use crate::quota::{QuotaAccountant, ResourceUsage};
use crate::rbac::{RbacService, StoreRbac};
use crate::request::*;
use crate::sagas::project::{self, ProjectCreateContext, ProjectDeleteContext};
use crate::sagas::workload::{self, WorkloadContext};
use crate::sagas::{
    ChartSettings, PROJECT_CREATE, PROJECT_DELETE, SagaDeps, WORKLOAD_DELETE, WORKLOAD_DEPLOY,
    WORKLOAD_UPDATE, new_saga_id,
};

/// Everything the provisioner takes from `kubemanager.toml`.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub defaults: ProjectDefaults,
    pub profiles: StepProfiles,
    pub chart: ChartSettings,
    pub public_address: String,
}

impl ProvisionSettings {
    pub fn from_config(config: &KubeManagerConfig) -> Self {
        Self {
            defaults: config.defaults.clone(),
            profiles: StepProfiles::from_config(&config.saga),
            chart: ChartSettings {
                path: config.cluster.chart_path.clone(),
                name: config.cluster.chart_name.clone(),
                version: config.cluster.chart_version.clone(),
                timeout: Duration::from_secs(config.cluster.helm_timeout_secs),
            },
            public_address: config.cluster.vps_address.clone(),
        }
    }
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self::from_config(&KubeManagerConfig::default())
    }
}

/// A saga running on a background task.
#[derive(Debug)]
pub struct SagaHandle {
    pub saga_id: String,
    task: JoinHandle<SagaResult<SagaOutcome>>,
}

impl SagaHandle {
    /// Wait for the saga to reach a terminal state. Dropping the handle
    /// instead leaves the saga running.
    pub async fn wait(self) -> ProvisionResult<SagaOutcome> {
        let outcome = self
            .task
            .await
            .map_err(|e| ProvisionError::Task(e.to_string()))??;
        Ok(outcome)
    }
}

struct Definitions {
    project_create: Arc<SagaDefinition<ProjectCreateContext>>,
    project_delete: Arc<SagaDefinition<ProjectDeleteContext>>,
    workload_deploy: Arc<SagaDefinition<WorkloadContext>>,
    workload_update: Arc<SagaDefinition<WorkloadContext>>,
    workload_delete: Arc<SagaDefinition<WorkloadContext>>,
}

impl Definitions {
    fn build(deps: &SagaDeps) -> Self {
        Self {
            project_create: Arc::new(project::create_definition(deps)),
            project_delete: Arc::new(project::delete_definition(deps)),
            workload_deploy: Arc::new(workload::deploy_definition(deps)),
            workload_update: Arc::new(workload::update_definition(deps)),
            workload_delete: Arc::new(workload::delete_definition(deps)),
        }
    }
}

#[derive(Clone)]
pub struct Provisioner {
    store: StateStore,
    engine: SagaEngine,
    gate: AdmissionGate,
    cluster: Arc<dyn ClusterProvisioner>,
    defaults: ProjectDefaults,
    chart: ChartSettings,
    definitions: Arc<Definitions>,
}

impl Provisioner {
    /// Build a provisioner with role bindings kept in the state store.
    pub fn new(
        store: StateStore,
        cluster: Arc<dyn ClusterProvisioner>,
        helm: Arc<dyn HelmInstaller>,
        settings: ProvisionSettings,
    ) -> Self {
        let rbac = Arc::new(StoreRbac::new(store.clone()));
        Self::with_rbac(store, cluster, helm, rbac, settings)
    }

    pub fn with_rbac(
        store: StateStore,
        cluster: Arc<dyn ClusterProvisioner>,
        helm: Arc<dyn HelmInstaller>,
        rbac: Arc<dyn RbacService>,
        settings: ProvisionSettings,
    ) -> Self {
        let gate = AdmissionGate::new(QuotaAccountant::new(store.clone()));
        let deps = SagaDeps {
            store: store.clone(),
            cluster: cluster.clone(),
            helm,
            rbac,
            gate: gate.clone(),
            profiles: settings.profiles,
            chart: settings.chart.clone(),
            public_address: settings.public_address,
        };
        Self {
            engine: SagaEngine::new(store.clone()),
            gate,
            store,
            cluster,
            defaults: settings.defaults,
            chart: settings.chart,
            definitions: Arc::new(Definitions::build(&deps)),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Validate the request and start the provisioning saga for `owner`.
    pub fn create_project(
        &self,
        req: CreateProjectRequest,
        owner: Uuid,
    ) -> ProvisionResult<(Accepted, SagaHandle)> {
        validate_name(&req.name)?;
        let (cpu_limit, memory_limit, storage_limit) =
            self.defaults
                .apply(&req.cpu_limit, &req.memory_limit, &req.storage_limit);
        quantity::cpu_millis(&cpu_limit)?;
        quantity::bytes(&memory_limit)?;
        quantity::bytes(&storage_limit)?;

        if self.store.get_project_by_name(&req.name)?.is_some() {
            return Err(ProvisionError::Conflict(format!(
                "project name {} is already taken",
                req.name
            )));
        }

        let project_id = Uuid::new_v4();
        let ctx = ProjectCreateContext {
            project_id,
            namespace: namespace_for(&req.name),
            name: req.name,
            description: req.description,
            owner_id: owner,
            cpu_limit,
            memory_limit,
            storage_limit,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let saga_id = new_saga_id(PROJECT_CREATE);
        info!(%project_id, name = %ctx.name, %saga_id, "project creation accepted");

        let handle = self.launch(
            saga_id.clone(),
            project_id.to_string(),
            self.definitions.project_create.clone(),
            ctx,
        );
        Ok((
            accepted(saga_id, project_id, ProjectStatus::Provisioning.as_str(), "project provisioning started"),
            handle,
        ))
    }

    /// Start the deletion saga. The project's workloads go with its namespace.
    pub fn delete_project(&self, project_id: &Uuid) -> ProvisionResult<(Accepted, SagaHandle)> {
        let project = self.project(project_id)?;
        if project.status == ProjectStatus::Deleting {
            return Err(ProvisionError::Conflict(format!(
                "project {project_id} is already being deleted"
            )));
        }

        let ctx = ProjectDeleteContext {
            project_id: project.id,
            namespace: namespace_for(&project.name),
            name: project.name,
        };
        let saga_id = new_saga_id(PROJECT_DELETE);
        info!(%project_id, %saga_id, "project deletion accepted");

        let handle = self.launch(
            saga_id.clone(),
            project_id.to_string(),
            self.definitions.project_delete.clone(),
            ctx,
        );
        Ok((
            accepted(saga_id, *project_id, ProjectStatus::Deleting.as_str(), "project deletion started"),
            handle,
        ))
    }

    /// Status and phase of a project. A READY project whose namespace can
    /// no longer be confirmed is reported as failed.
    pub async fn get_status(&self, project_id: &Uuid) -> ProvisionResult<ProjectStatusView> {
        let project = self.project(project_id)?;
        let mut view = ProjectStatusView {
            project_id: project.id,
            name: project.name.clone(),
            status: project.status,
            phase: project.current_phase.clone(),
            namespace: None,
            created_at: project.created_at,
        };
        if project.status != ProjectStatus::Ready {
            return Ok(view);
        }

        let namespace = namespace_for(&project.name);
        match self.cluster.get_namespace(&namespace).await {
            Ok(Some(info)) => view.namespace = Some(info),
            Ok(None) => {
                warn!(%project_id, %namespace, "ready project has no namespace");
                mark_failed(&mut view);
            }
            Err(e) => {
                warn!(%project_id, %namespace, error = %e, "namespace lookup failed");
                mark_failed(&mut view);
            }
        }
        Ok(view)
    }

    /// Live usage of the namespace next to the reserved totals.
    pub async fn get_metrics(&self, project_id: &Uuid) -> ProvisionResult<ProjectMetrics> {
        let project = self.project(project_id)?;
        let usage = self
            .cluster
            .namespace_usage(&namespace_for(&project.name))
            .await?;
        let reserved = self.gate.accountant().total_usage(project_id)?;

        Ok(ProjectMetrics {
            project_id: project.id,
            cpu_usage: format_millicores(usage.cpu_milli),
            memory_usage: format_mebibytes(usage.memory_bytes),
            reserved: ReservedResources {
                cpu_milli: reserved.cpu_milli,
                memory_mi: reserved.memory_mi(),
                storage_gi: reserved.storage_gi(),
            },
            cpu_limit: project.cpu_limit,
            memory_limit: project.memory_limit,
            storage_limit: project.storage_limit,
        })
    }

    pub fn list_projects(&self) -> ProvisionResult<Vec<Project>> {
        Ok(self.store.list_projects()?)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Admit the workload, record it and start the deployment saga.
    pub async fn deploy_workload(
        &self,
        req: DeployWorkloadRequest,
    ) -> ProvisionResult<(Accepted, SagaHandle)> {
        let project = self.ready_project(&req.project_id)?;
        validate_name(&req.name)?;

        let cpu_limit = req.cpu_limit.unwrap_or_else(|| DEFAULT_CPU.to_string());
        let memory_limit = req.memory_limit.unwrap_or_else(|| DEFAULT_MEMORY.to_string());
        let now = epoch_secs();
        let workload = Workload {
            id: Uuid::new_v4(),
            project_id: project.id,
            namespace: namespace_for(&project.name),
            release_name: req.name.clone(),
            name: req.name,
            chart_name: self.chart.name.clone(),
            chart_version: self.chart.version.clone(),
            image: req.image,
            cpu_request: req.cpu_request.unwrap_or_else(|| cpu_limit.clone()),
            memory_request: req.memory_request.unwrap_or_else(|| memory_limit.clone()),
            cpu_limit,
            memory_limit,
            storage_size: req
                .storage_size
                .unwrap_or_else(|| DEFAULT_STORAGE_SIZE.to_string()),
            storage_class: req
                .storage_class
                .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
            persistence_enabled: req.persistence_enabled,
            mount_path: req
                .mount_path
                .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string()),
            replicas: req.replicas.unwrap_or(DEFAULT_REPLICAS),
            target_port: req.target_port.unwrap_or(DEFAULT_TARGET_PORT),
            service_type: req
                .service_type
                .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
            env_vars: req.env_vars,
            external_url: None,
            status: WorkloadStatus::Starting,
            current_phase: WorkloadPhase::HelmChartLoading.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        let requested = shape_of(&workload)?;

        // The insert rejects a duplicate name; doing it under the permit
        // keeps the admitted reservation and the row together.
        let permit = self.gate.admit(&project, requested, None).await?;
        self.store.insert_workload(&workload)?;
        drop(permit);

        let saga_id = new_saga_id(WORKLOAD_DEPLOY);
        info!(workload_id = %workload.id, name = %workload.name, %saga_id, "workload deployment accepted");
        let ctx = WorkloadContext::for_workload(&workload, Some(req.secrets));
        let handle = self.launch(
            saga_id.clone(),
            workload.id.to_string(),
            self.definitions.workload_deploy.clone(),
            ctx,
        );
        Ok((
            accepted(saga_id, workload.id, WorkloadStatus::Starting.as_str(), "workload deployment started"),
            handle,
        ))
    }

    /// Re-admit the changed shape and re-apply the release.
    pub async fn update_workload(
        &self,
        workload_id: &Uuid,
        req: UpdateWorkloadRequest,
    ) -> ProvisionResult<(Accepted, SagaHandle)> {
        let current = self.workload(workload_id)?;
        ensure_idle(&current)?;
        let project = self.ready_project(&current.project_id)?;

        let mut updated = current.clone();
        if let Some(size) = req.storage_size {
            if quantity::bytes(&size)? < quantity::bytes(&current.storage_size)? {
                return Err(ProvisionError::Unsupported(format!(
                    "shrinking storage from {} to {size}",
                    current.storage_size
                )));
            }
            updated.storage_size = size;
        }
        if let Some(image) = req.image {
            updated.image = image;
        }
        ImageRef::parse(&updated.image)?;
        if let Some(replicas) = req.replicas {
            updated.replicas = replicas;
        }
        if let Some(cpu) = req.cpu_limit {
            updated.cpu_limit = cpu;
        }
        if let Some(cpu) = req.cpu_request {
            updated.cpu_request = cpu;
        }
        if let Some(memory) = req.memory_limit {
            updated.memory_limit = memory;
        }
        if let Some(memory) = req.memory_request {
            updated.memory_request = memory;
        }
        if let Some(env) = req.env_vars {
            updated.env_vars = env;
        }
        let requested = shape_of(&updated)?;

        let permit = self
            .gate
            .admit(&project, requested, Some(workload_id))
            .await?;
        updated.status = WorkloadStatus::Scaling;
        updated.current_phase = WorkloadPhase::HelmPreparing.as_str().to_string();
        let updated = self.store.modify_workload(workload_id, |stored| {
            ensure_idle(stored)?;
            *stored = updated;
            Ok(())
        })?;
        drop(permit);

        let saga_id = new_saga_id(WORKLOAD_UPDATE);
        info!(%workload_id, %saga_id, "workload update accepted");
        let ctx = WorkloadContext::for_workload(&updated, req.secrets);
        let handle = self.launch(
            saga_id.clone(),
            workload_id.to_string(),
            self.definitions.workload_update.clone(),
            ctx,
        );
        Ok((
            accepted(saga_id, *workload_id, WorkloadStatus::Scaling.as_str(), "workload update started"),
            handle,
        ))
    }

    /// Mark the workload DELETED and start the deletion saga. A workload
    /// with a deployment or update in flight is refused.
    pub fn delete_workload(&self, workload_id: &Uuid) -> ProvisionResult<(Accepted, SagaHandle)> {
        let workload = self.store.modify_workload(workload_id, |stored| {
            ensure_idle(stored)?;
            stored.status = WorkloadStatus::Deleted;
            stored.current_phase = WorkloadPhase::HelmUninstalling.as_str().to_string();
            Ok(())
        })?;
        let saga_id = new_saga_id(WORKLOAD_DELETE);
        info!(%workload_id, %saga_id, "workload deletion accepted");

        let ctx = WorkloadContext::for_workload(&workload, None);
        let handle = self.launch(
            saga_id.clone(),
            workload_id.to_string(),
            self.definitions.workload_delete.clone(),
            ctx,
        );
        Ok((
            accepted(saga_id, *workload_id, WorkloadStatus::Deleted.as_str(), "workload deletion started"),
            handle,
        ))
    }

    pub fn get_workload(&self, workload_id: &Uuid) -> ProvisionResult<Workload> {
        self.workload(workload_id)
    }

    pub fn list_workloads(&self, project_id: &Uuid) -> ProvisionResult<Vec<Workload>> {
        self.project(project_id)?;
        Ok(self.store.list_workloads_for_project(project_id)?)
    }

    // ── Sagas ──────────────────────────────────────────────────────

    pub fn saga_status(&self, saga_id: &str) -> ProvisionResult<SagaRecord> {
        Ok(self.engine.status(saga_id)?)
    }

    pub fn cancel_saga(&self, saga_id: &str) -> ProvisionResult<()> {
        Ok(self.engine.request_cancel(saga_id)?)
    }

    /// Pick up every saga a previous process left unfinished.
    pub fn resume_incomplete(&self) -> ProvisionResult<Vec<SagaHandle>> {
        let mut handles = Vec::new();
        for record in self.store.list_incomplete_sagas()? {
            let defs = &self.definitions;
            let handle = match record.kind.as_str() {
                PROJECT_CREATE => self.resume(record.id, defs.project_create.clone()),
                PROJECT_DELETE => self.resume(record.id, defs.project_delete.clone()),
                WORKLOAD_DEPLOY => self.resume(record.id, defs.workload_deploy.clone()),
                WORKLOAD_UPDATE => self.resume(record.id, defs.workload_update.clone()),
                WORKLOAD_DELETE => self.resume(record.id, defs.workload_delete.clone()),
                other => {
                    warn!(saga_id = %record.id, kind = other, "unknown saga kind, not resuming");
                    continue;
                }
            };
            handles.push(handle);
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "resumed incomplete sagas");
        }
        Ok(handles)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn project(&self, project_id: &Uuid) -> ProvisionResult<Project> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| ProvisionError::NotFound(format!("project {project_id}")))
    }

    fn ready_project(&self, project_id: &Uuid) -> ProvisionResult<Project> {
        let project = self.project(project_id)?;
        if project.status != ProjectStatus::Ready {
            return Err(ProvisionError::Conflict(format!(
                "project {} is {}, not READY",
                project.name, project.status
            )));
        }
        Ok(project)
    }

    fn workload(&self, workload_id: &Uuid) -> ProvisionResult<Workload> {
        self.store
            .get_workload(workload_id)?
            .ok_or_else(|| ProvisionError::NotFound(format!("workload {workload_id}")))
    }

    fn launch<C: SagaContext>(
        &self,
        saga_id: String,
        correlation_id: String,
        def: Arc<SagaDefinition<C>>,
        ctx: C,
    ) -> SagaHandle {
        let engine = self.engine.clone();
        let span = info_span!("saga", saga_id = %saga_id, kind = def.kind());
        let id = saga_id.clone();
        let task = tokio::spawn(
            async move {
                let report = engine.start(&id, &correlation_id, &def, ctx).await;
                finish(&id, report.map(|r| r.outcome))
            }
            .instrument(span),
        );
        SagaHandle { saga_id, task }
    }

    fn resume<C: SagaContext>(&self, saga_id: String, def: Arc<SagaDefinition<C>>) -> SagaHandle {
        let engine = self.engine.clone();
        let span = info_span!("saga", saga_id = %saga_id, kind = def.kind());
        let id = saga_id.clone();
        let task = tokio::spawn(
            async move {
                let report = engine.resume(&id, &def).await;
                finish(&id, report.map(|r| r.outcome))
            }
            .instrument(span),
        );
        SagaHandle { saga_id, task }
    }
}

fn finish(saga_id: &str, result: SagaResult<SagaOutcome>) -> SagaResult<SagaOutcome> {
    match &result {
        Ok(outcome) => info!(saga_id, outcome = ?outcome, "saga finished"),
        Err(e) => error!(saga_id, error = %e, "saga aborted"),
    }
    result
}

/// Refuse a new operation while another one owns the workload.
fn ensure_idle(workload: &Workload) -> StateResult<()> {
    match workload.status {
        WorkloadStatus::Starting | WorkloadStatus::Scaling => Err(StateError::Conflict(format!(
            "workload {} has an operation in progress",
            workload.id
        ))),
        WorkloadStatus::Deleted => Err(StateError::Conflict(format!(
            "workload {} is being deleted",
            workload.id
        ))),
        _ => Ok(()),
    }
}

/// Reservation of a workload shape, with its requests checked as well.
fn shape_of(workload: &Workload) -> ProvisionResult<ResourceUsage> {
    quantity::cpu_millis(&workload.cpu_request)?;
    quantity::bytes(&workload.memory_request)?;
    Ok(ResourceUsage::of_workload(workload)?)
}

fn mark_failed(view: &mut ProjectStatusView) {
    view.status = ProjectStatus::Error;
    view.phase = ProjectPhase::ProvisioningFailed.as_str().to_string();
}

fn accepted(saga_id: String, resource_id: Uuid, status: &str, message: &str) -> Accepted {
    Accepted {
        saga_id,
        resource_id,
        status: status.to_string(),
        message: message.to_string(),
    }
}

//! Naming rules shared by the control plane and the cluster side.
//!
//! Every project maps to one namespace `km-<project-name>`; every workload
//! maps to one Helm release named after the workload, whose environment
//! secret is `<release>-env`.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const NAMESPACE_PREFIX: &str = "km-";
pub const QUOTA_OBJECT_NAME: &str = "project-quota";

pub const LABEL_MANAGED: &str = "kubemanager.io/managed";
pub const LABEL_PROJECT_ID: &str = "kubemanager.io/project-id";
pub const LABEL_NAME: &str = "kubemanager.io/name";
pub const ANNOTATION_CREATED_AT: &str = "kubemanager.io/created-at";

pub const MIN_NAME_LEN: usize = 1;
pub const MAX_NAME_LEN: usize = 30;

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

/// Namespace that hosts every workload of a project.
pub fn namespace_for(project_name: &str) -> String {
    format!("{NAMESPACE_PREFIX}{project_name}")
}

/// Secret holding a release's environment.
pub fn env_secret_name(release: &str) -> String {
    format!("{release}-env")
}

/// Public ingress host for a release: `<release>-<id6>.<address>.sslip.io`.
pub fn ingress_host(release: &str, project_id: &Uuid, public_address: &str) -> String {
    let id = project_id.to_string();
    let short = &id[..6];
    format!("{release}-{short}.{public_address}.sslip.io")
}

/// Project and workload names double as namespace / release names, so they
/// must be DNS labels of bounded length.
pub fn validate_name(name: &str) -> CoreResult<()> {
    let invalid = |reason: &str| CoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
        return Err(invalid("length must be between 1 and 30 characters"));
    }
    if !DNS_LABEL.is_match(name) {
        return Err(invalid(
            "must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric",
        ));
    }
    Ok(())
}

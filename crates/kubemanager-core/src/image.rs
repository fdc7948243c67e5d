//! Container image references as accepted by the workload API.
//!
//! The accepted form is `repository[:tag]`. A missing tag means `latest`.
//! Registry ports (`host:5000/app`) are not supported: more than one `:`
//! is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> CoreResult<Self> {
        let image = image.trim();
        let mut parts = image.split(':');
        let repository = parts.next().unwrap_or_default();
        let tag = parts.next();
        if parts.next().is_some() || repository.is_empty() {
            return Err(CoreError::InvalidImage(image.to_string()));
        }
        let tag = match tag {
            Some("") => return Err(CoreError::InvalidImage(image.to_string())),
            Some(tag) => tag,
            None => DEFAULT_TAG,
        };
        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

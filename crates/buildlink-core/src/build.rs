//! Build request records.
//!
//! The application-definition compiler that produces these lives outside this
//! workspace; the executor only needs the compiled form.

use crate::Platform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A previously recorded build request, carried verbatim inside a token.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildRequest {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub spec: BuildSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSpec {
    /// Source of the application definition, stored in the app image.
    pub acornfile: String,
    /// Empty means the executor's native platform.
    pub platforms: Vec<Platform>,
    /// Images to build, keyed by name. Built in key order.
    pub images: BTreeMap<String, ImageBuild>,
}

/// How to build one image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageBuild {
    /// Build context, relative to the client's working directory.
    pub context: String,
    pub dockerfile: String,
    /// Inline dockerfile; takes precedence over `dockerfile` when set.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dockerfile_contents: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_contexts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target: String,
}

impl ImageBuild {
    pub fn new(context: impl Into<String>, dockerfile: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            dockerfile: dockerfile.into(),
            ..Default::default()
        }
    }
}

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::{sanitize_dns_name, GitEvent};

/// Desired state of one application in one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub app: String,
    pub env: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Deploy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<Cleanup>,
    #[serde(default)]
    pub chart: Chart,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub values: serde_json::Map<String, serde_json::Value>,
}

/// Helm-style chart reference. `name` may also be a git URL carrying
/// `path`, `sha`, `tag` or `branch` query parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Deploy rule gating automatic deployment from artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deploy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<GitEvent>,
}

/// Cleanup rule matched when a tracked source branch disappears.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cleanup {
    pub event: CleanupEvent,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupEvent {
    #[serde(rename = "branchDeleted")]
    BranchDeleted,
}

// Go-template style context references ({{ .BRANCH }}) are accepted in
// manifests; the leading dot is stripped before handing the document to
// the template engine.
static DOTTED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([\s-]*)\.").expect("static regex must parse"));

impl Manifest {
    /// Resolves template placeholders in every field of the manifest
    /// against the given variables.
    ///
    /// Resolution is whole-document: the manifest is serialized to YAML,
    /// templated, then parsed back, so placeholders work inside nested
    /// value trees as well.
    pub fn resolve_vars(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let manifest_string =
            serde_yaml::to_string(self).context("cannot serialize manifest")?;

        let normalized = DOTTED_VAR.replace_all(&manifest_string, "{{$1");

        let mut env = Environment::new();
        env.add_filter("sanitizeDNSName", |s: String| sanitize_dns_name(&s));
        let templated = env
            .render_str(&normalized, vars)
            .context("cannot template manifest")?;

        *self = serde_yaml::from_str(&templated)
            .context("cannot parse templated manifest")?;
        Ok(())
    }
}

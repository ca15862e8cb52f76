use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Manifest;

/// Git event kind that produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitEvent {
    #[default]
    Push,
    Tag,
    Pr,
}

impl GitEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitEvent::Push => "push",
            GitEvent::Tag => "tag",
            GitEvent::Pr => "pr",
        }
    }
}

impl std::str::FromStr for GitEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(GitEvent::Push),
            "tag" => Ok(GitEvent::Tag),
            "pr" => Ok(GitEvent::Pr),
            other => Err(anyhow::anyhow!("unknown git event: {}", other)),
        }
    }
}

/// The releasable version an artifact was built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default)]
    pub event: GitEvent,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub committer_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub committer_email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

/// Artifact contains all metadata that can be later used for releasing
/// and auditing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub created: i64,

    /// The releasable version
    #[serde(default)]
    pub version: Version,

    /// Arbitrary environment variables from CI
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,

    /// The complete set of environments this artifact can be deployed to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<Manifest>,

    /// CI job information, test results, image references, etc
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Artifact {
    /// Collects the variables a manifest can be templated with: the CI
    /// context plus every string field of the attached items.
    pub fn vars(&self) -> HashMap<String, String> {
        let mut vars = self.context.clone();
        for item in &self.items {
            for (key, value) in item {
                if let Some(s) = value.as_str() {
                    vars.insert(key.clone(), s.to_string());
                }
            }
        }
        vars
    }
}

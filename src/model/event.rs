use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dx::{Artifact, GitEvent};

pub const STATUS_NEW: &str = "new";
pub const STATUS_PROCESSED: &str = "processed";
pub const STATUS_ERROR: &str = "error";

/// The kind of work an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "artifact")]
    Artifact,
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "rollback")]
    Rollback,
    #[serde(rename = "branchDeleted")]
    BranchDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Artifact => "artifact",
            EventType::Release => "release",
            EventType::Rollback => "rollback",
            EventType::BranchDeleted => "branchDeleted",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "artifact" => Ok(EventType::Artifact),
            "release" => Ok(EventType::Release),
            "rollback" => Ok(EventType::Rollback),
            "branchDeleted" => Ok(EventType::BranchDeleted),
            other => Err(anyhow::anyhow!("unknown event type: {}", other)),
        }
    }
}

/// Unit of work in the event store.
///
/// The type-specific payload lives in `blob`; the version fields are
/// denormalized columns so API filters run in SQL without parsing blobs.
/// `gitops_hashes` records the commits produced by processing the event
/// and is written exactly once, together with the terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub created: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blob: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_desc: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<GitEvent>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub artifact_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gitops_hashes: Vec<String>,
}

impl Event {
    /// Wraps an ingested artifact into its storage representation,
    /// denormalizing the version fields for indexing.
    pub fn from_artifact(artifact: &Artifact) -> Result<Event> {
        let blob = serde_json::to_string(artifact).context("cannot serialize artifact")?;

        Ok(Event {
            id: String::new(),
            created: 0,
            event_type: EventType::Artifact,
            blob,
            status: String::new(),
            status_desc: String::new(),
            repository: artifact.version.repository_name.clone(),
            branch: artifact.version.branch.clone(),
            event: Some(artifact.version.event),
            source_branch: artifact.version.source_branch.clone(),
            target_branch: artifact.version.target_branch.clone(),
            tag: artifact.version.tag.clone(),
            sha: artifact.version.sha.clone(),
            artifact_id: artifact.id.clone(),
            gitops_hashes: Vec::new(),
        })
    }

    /// Parses the blob of an artifact event back into the artifact.
    pub fn as_artifact(&self) -> Result<Artifact> {
        serde_json::from_str(&self.blob).context("cannot parse artifact blob")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dx::Version;

    #[test]
    fn test_artifact_event_round_trip() {
        let artifact = Artifact {
            id: "my-app-1234".to_string(),
            version: Version {
                repository_name: "acme/my-app".to_string(),
                branch: "master".to_string(),
                sha: "ea9ab7cc".to_string(),
                event: GitEvent::Push,
                ..Default::default()
            },
            ..Default::default()
        };

        let event = Event::from_artifact(&artifact).unwrap();
        assert_eq!(EventType::Artifact, event.event_type);
        assert_eq!("acme/my-app", event.repository);
        assert_eq!("my-app-1234", event.artifact_id);

        let parsed = event.as_artifact().unwrap();
        assert_eq!(artifact.id, parsed.id);
        assert_eq!(artifact.version.sha, parsed.version.sha);
    }
}

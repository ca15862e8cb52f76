use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::Row;
use uuid::Uuid;

use crate::dx::GitEvent;
use crate::model::{Event, STATUS_NEW};

use super::Store;

const EVENT_COLUMNS: &str = "id, created, type, blob, status, status_desc, repository, branch, \
     event, source_branch, target_branch, tag, sha, artifact_id, gitops_hashes";

/// Filters for the artifact listing endpoint. All fields are optional;
/// the default query returns the ten most recent artifacts.
#[derive(Debug, Clone, Default)]
pub struct ArtifactsQuery {
    pub repository: String,
    pub branch: String,
    pub event: Option<GitEvent>,
    pub source_branch: String,
    pub sha: Vec<String>,
    pub limit: usize,
    pub offset: usize,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl Store {
    /// Stores a new event. Assigns the created timestamp, sets the
    /// status to `new`, and generates an id unless the caller brought
    /// one (artifact events share their id with the artifact).
    pub fn create_event(&self, mut event: Event) -> Result<Event> {
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        event.created = Utc::now().timestamp();
        event.status = STATUS_NEW.to_string();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (id, created, type, blob, status, status_desc, repository, branch, \
             event, source_branch, target_branch, tag, sha, artifact_id, gitops_hashes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                event.id,
                event.created,
                event.event_type.as_str(),
                event.blob,
                event.status,
                event.status_desc,
                event.repository,
                event.branch,
                event.event.map(|e| e.as_str()),
                event.source_branch,
                event.target_branch,
                event.tag,
                event.sha,
                event.artifact_id,
                serde_json::to_string(&event.gitops_hashes)?,
            ],
        )
        .context("cannot insert event")?;

        Ok(event)
    }

    /// Returns artifact events within the given constraints, most recent
    /// first.
    pub fn artifacts(&self, query: &ArtifactsQuery) -> Result<Vec<Event>> {
        let mut filters = vec!["type = ?".to_string()];
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new("artifact".to_string())];

        if let Some(since) = query.since {
            filters.push("created >= ?".to_string());
            args.push(Box::new(since.timestamp()));
        }
        if let Some(until) = query.until {
            filters.push("created < ?".to_string());
            args.push(Box::new(until.timestamp()));
        }
        if !query.repository.is_empty() {
            filters.push("repository = ?".to_string());
            args.push(Box::new(query.repository.clone()));
        }
        if !query.branch.is_empty() {
            filters.push("branch = ?".to_string());
            args.push(Box::new(query.branch.clone()));
        }
        if !query.source_branch.is_empty() {
            filters.push("source_branch = ?".to_string());
            args.push(Box::new(query.source_branch.clone()));
        }
        if let Some(event) = query.event {
            filters.push("event = ?".to_string());
            args.push(Box::new(event.as_str().to_string()));
        }
        if !query.sha.is_empty() {
            let placeholders = vec!["?"; query.sha.len()].join(",");
            filters.push(format!("sha IN ({})", placeholders));
            for sha in &query.sha {
                args.push(Box::new(sha.clone()));
            }
        }

        let mut limit = query.limit;
        if limit == 0 && query.offset == 0 {
            limit = 10;
        }

        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY created DESC LIMIT {} OFFSET {}",
            EVENT_COLUMNS,
            filters.join(" AND "),
            limit,
            query.offset,
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<Event>>>()
            .context("cannot query artifacts")?;
        Ok(rows)
    }

    /// Returns the artifact event with the given artifact id.
    pub fn artifact(&self, artifact_id: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM events WHERE artifact_id = ?1",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([artifact_id], row_to_event)?;
        rows.next().transpose().context("cannot query artifact")
    }

    /// Returns an event by id.
    pub fn event(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([id], row_to_event)?;
        rows.next().transpose().context("cannot query event")
    }

    /// Returns up to ten unprocessed events in creation order, ties
    /// broken by id. The worker is the only consumer, so no claim
    /// locking is needed.
    pub fn unprocessed_events(&self) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM events WHERE status = 'new' ORDER BY created ASC, id ASC LIMIT 10",
            EVENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_event)?
            .collect::<rusqlite::Result<Vec<Event>>>()
            .context("cannot query unprocessed events")?;
        Ok(rows)
    }

    /// Source repositories that shipped at least one artifact with a
    /// cleanup policy; these get mirrored for branch-deletion tracking.
    pub fn repos_with_cleanup_policy(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT repository FROM events \
             WHERE type = 'artifact' AND repository != '' AND blob LIKE '%\"cleanup\"%'",
        )?;
        let repos = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("cannot query repos with cleanup policy")?;
        Ok(repos)
    }

    /// Writes the terminal status of an event, together with the gitops
    /// hashes its processing produced.
    pub fn update_event_status(
        &self,
        id: &str,
        status: &str,
        status_desc: &str,
        gitops_hashes: &[String],
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE events SET status = ?1, status_desc = ?2, gitops_hashes = ?3 WHERE id = ?4",
            rusqlite::params![
                status,
                status_desc,
                serde_json::to_string(gitops_hashes)?,
                id
            ],
        )
        .context("cannot update event status")?;
        Ok(())
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get("type")?;
    let event: Option<String> = row.get("event")?;
    let gitops_hashes: String = row.get("gitops_hashes")?;

    Ok(Event {
        id: row.get("id")?,
        created: row.get("created")?,
        event_type: event_type.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(2, "type".to_string(), rusqlite::types::Type::Text)
        })?,
        blob: row.get("blob")?,
        status: row.get("status")?,
        status_desc: row.get("status_desc")?,
        repository: row.get("repository")?,
        branch: row.get("branch")?,
        event: event.and_then(|e| e.parse().ok()),
        source_branch: row.get("source_branch")?,
        target_branch: row.get("target_branch")?,
        tag: row.get("tag")?,
        sha: row.get("sha")?,
        artifact_id: row.get("artifact_id")?,
        gitops_hashes: serde_json::from_str(&gitops_hashes).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dx::{Artifact, Version};
    use crate::model::{EventType, STATUS_PROCESSED};

    fn artifact_event(id: &str, branch: &str) -> Event {
        let artifact = Artifact {
            id: id.to_string(),
            version: Version {
                repository_name: "acme/my-app".to_string(),
                branch: branch.to_string(),
                sha: format!("sha-{}", id),
                event: GitEvent::Push,
                ..Default::default()
            },
            ..Default::default()
        };
        Event::from_artifact(&artifact).unwrap()
    }

    #[test]
    fn test_create_and_fetch_event() {
        let store = Store::new_in_memory().unwrap();
        let saved = store.create_event(artifact_event("a-1", "master")).unwrap();

        assert!(!saved.id.is_empty());
        assert_eq!(STATUS_NEW, saved.status);
        assert!(saved.created > 0);

        let fetched = store.event(&saved.id).unwrap().unwrap();
        assert_eq!(saved.id, fetched.id);
        assert_eq!(EventType::Artifact, fetched.event_type);
        assert_eq!("master", fetched.branch);
    }

    #[test]
    fn test_event_not_found() {
        let store = Store::new_in_memory().unwrap();
        assert!(store.event("no-such-id").unwrap().is_none());
        assert!(store.artifact("no-such-id").unwrap().is_none());
    }

    #[test]
    fn test_unprocessed_events_in_created_order() {
        let store = Store::new_in_memory().unwrap();
        let first = store.create_event(artifact_event("a-1", "master")).unwrap();
        let second = store.create_event(artifact_event("a-2", "master")).unwrap();

        let unprocessed = store.unprocessed_events().unwrap();
        assert_eq!(2, unprocessed.len());

        store
            .update_event_status(&first.id, STATUS_PROCESSED, "", &[])
            .unwrap();
        let unprocessed = store.unprocessed_events().unwrap();
        assert_eq!(1, unprocessed.len());
        assert_eq!(second.id, unprocessed[0].id);
    }

    #[test]
    fn test_update_event_status_writes_hashes() {
        let store = Store::new_in_memory().unwrap();
        let saved = store.create_event(artifact_event("a-1", "master")).unwrap();

        let hashes = vec!["abc123".to_string(), "def456".to_string()];
        store
            .update_event_status(&saved.id, STATUS_PROCESSED, "", &hashes)
            .unwrap();

        let fetched = store.event(&saved.id).unwrap().unwrap();
        assert_eq!(STATUS_PROCESSED, fetched.status);
        assert_eq!(hashes, fetched.gitops_hashes);
    }

    #[test]
    fn test_artifacts_filters() {
        let store = Store::new_in_memory().unwrap();
        store.create_event(artifact_event("a-1", "master")).unwrap();
        store.create_event(artifact_event("a-2", "feature")).unwrap();

        let all = store.artifacts(&ArtifactsQuery::default()).unwrap();
        assert_eq!(2, all.len());

        let by_branch = store
            .artifacts(&ArtifactsQuery {
                branch: "feature".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(1, by_branch.len());
        assert_eq!("a-2", by_branch[0].artifact_id);

        let by_sha = store
            .artifacts(&ArtifactsQuery {
                sha: vec!["sha-a-1".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(1, by_sha.len());

        let none = store
            .artifacts(&ArtifactsQuery {
                repository: "acme/other".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_artifact_lookup_by_artifact_id() {
        let store = Store::new_in_memory().unwrap();
        store.create_event(artifact_event("a-1", "master")).unwrap();

        let found = store.artifact("a-1").unwrap().unwrap();
        let artifact = found.as_artifact().unwrap();
        assert_eq!("a-1", artifact.id);
    }
}

use anyhow::{Context, Result};
use rusqlite::Row;

use crate::model::GitopsCommit;

use super::Store;

impl Store {
    /// Upserts a reconciler status record keyed by commit SHA. The first
    /// callback creates the row; later callbacks only overwrite status
    /// and description.
    pub fn save_or_update_gitops_commit(&self, gitops_commit: &GitopsCommit) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO gitops_commits (sha, status, status_desc) VALUES (?1, ?2, ?3) \
             ON CONFLICT(sha) DO UPDATE SET status = ?2, status_desc = ?3",
            rusqlite::params![
                gitops_commit.sha,
                gitops_commit.status,
                gitops_commit.status_desc
            ],
        )
        .context("cannot upsert gitops commit")?;
        Ok(())
    }

    pub fn gitops_commit(&self, sha: &str) -> Result<Option<GitopsCommit>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, sha, status, status_desc FROM gitops_commits WHERE sha = ?1")?;
        let mut rows = stmt.query_map([sha], row_to_gitops_commit)?;
        rows.next()
            .transpose()
            .context("cannot query gitops commit")
    }
}

fn row_to_gitops_commit(row: &Row<'_>) -> rusqlite::Result<GitopsCommit> {
    Ok(GitopsCommit {
        id: row.get("id")?,
        sha: row.get("sha")?,
        status: row.get("status")?,
        status_desc: row.get("status_desc")?,
    })
}

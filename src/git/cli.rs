//! Thin wrapper over the command-line git binary.
//!
//! Command-line git is used instead of a git library: the CLI's
//! working-tree semantics, revert conflict handling and SSH transport
//! are the reference behavior here.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;
use tracing::debug;

const COMMIT_AUTHOR_NAME: &str = "Gimlet CLI";
const COMMIT_AUTHOR_EMAIL: &str = "cli@gimlet.io";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found or not runnable: {0}")]
    NotAvailable(#[from] std::io::Error),
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// One commit of a path-limited history walk.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub sha: String,
    pub created: i64,
    pub message: String,
}

/// Handle over a local working copy.
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
    ssh_key_path: Option<PathBuf>,
}

impl Repo {
    pub fn open(path: impl Into<PathBuf>, ssh_key_path: Option<PathBuf>) -> Repo {
        Repo {
            path: path.into(),
            ssh_key_path,
        }
    }

    /// Clones `url` into `dest`.
    pub fn clone(
        url: &str,
        dest: &Path,
        ssh_key_path: Option<PathBuf>,
    ) -> Result<Repo, GitError> {
        run_git(
            None,
            ssh_key_path.as_deref(),
            &["clone", url, &dest.to_string_lossy()],
        )?;
        Ok(Repo::open(dest, ssh_key_path))
    }

    /// Shallow clone without tags; used for mirrored source repos where
    /// only the branch tips matter.
    pub fn clone_shallow(
        url: &str,
        dest: &Path,
        depth: u32,
        ssh_key_path: Option<PathBuf>,
    ) -> Result<Repo, GitError> {
        run_git(
            None,
            ssh_key_path.as_deref(),
            &[
                "clone",
                "--depth",
                &depth.to_string(),
                "--no-single-branch",
                "--no-tags",
                url,
                &dest.to_string_lossy(),
            ],
        )?;
        Ok(Repo::open(dest, ssh_key_path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initializes a fresh repository. Used by tests and the mirror
    /// bootstrap; commits get the fixed signing identity either way.
    pub fn init(path: &Path) -> Result<Repo, GitError> {
        run_git(None, None, &["init", "-b", "main", &path.to_string_lossy()])?;
        Ok(Repo::open(path, None))
    }

    pub fn head(&self) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// True if the working tree has no staged or unstaged changes.
    pub fn is_clean(&self) -> Result<bool, GitError> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.stdout.is_empty())
    }

    pub fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "-A"])?;
        Ok(())
    }

    /// Commits the staged changes and returns the new HEAD sha.
    pub fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run(&[
            "-c",
            &format!("user.name={}", COMMIT_AUTHOR_NAME),
            "-c",
            &format!("user.email={}", COMMIT_AUTHOR_EMAIL),
            "commit",
            "-m",
            message,
        ])?;
        self.head()
    }

    pub fn push(&self) -> Result<(), GitError> {
        self.run(&["push", "origin", "HEAD"])?;
        Ok(())
    }

    pub fn fetch(&self) -> Result<(), GitError> {
        self.run(&["fetch", "origin"])?;
        Ok(())
    }

    pub fn fetch_prune(&self) -> Result<(), GitError> {
        self.run(&["fetch", "origin", "--prune"])?;
        Ok(())
    }

    /// Reverts a commit with the native conflict handling; the conflict
    /// stderr surfaces in the returned error.
    pub fn revert(&self, sha: &str) -> Result<(), GitError> {
        self.run(&[
            "-c",
            &format!("user.name={}", COMMIT_AUTHOR_NAME),
            "-c",
            &format!("user.email={}", COMMIT_AUTHOR_EMAIL),
            "revert",
            "--no-edit",
            sha,
        ])?;
        Ok(())
    }

    pub fn revert_abort(&self) -> Result<(), GitError> {
        self.run(&["revert", "--abort"])?;
        Ok(())
    }

    pub fn checkout(&self, rev: &str) -> Result<(), GitError> {
        self.run(&["checkout", rev])?;
        Ok(())
    }

    /// History of commits touching `path`, newest first.
    pub fn log_touching(&self, path: &str) -> Result<Vec<CommitInfo>, GitError> {
        let out = self.run(&["log", "--format=%H%x09%ct%x09%s", "--", path])?;
        Ok(parse_log(&String::from_utf8_lossy(&out.stdout)))
    }

    /// The most recent commit touching `path`.
    pub fn last_commit_touching(&self, path: &str) -> Result<Option<CommitInfo>, GitError> {
        let out = self.run(&["log", "-1", "--format=%H%x09%ct%x09%s", "--", path])?;
        Ok(parse_log(&String::from_utf8_lossy(&out.stdout)).into_iter().next())
    }

    /// Shas of commits touching `path` whose message contains `needle`.
    pub fn log_grep(&self, path: &str, needle: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&[
            "log",
            "--fixed-strings",
            &format!("--grep={}", needle),
            "--format=%H",
            "--",
            path,
        ])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Commits reachable from HEAD but not from `since`, newest first.
    pub fn commits_since(&self, since: &str) -> Result<Vec<String>, GitError> {
        let out = self.run(&["log", "--format=%H", &format!("{}..HEAD", since)])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// The content of `path` at `rev`, or None if the file does not
    /// exist in that tree.
    pub fn file_at(&self, rev: &str, path: &str) -> Result<Option<String>, GitError> {
        match self.run(&["show", &format!("{}:{}", rev, path)]) {
            Ok(out) => Ok(Some(String::from_utf8_lossy(&out.stdout).into_owned())),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist") || stderr.contains("exists on disk") =>
            {
                Ok(None)
            }
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("fatal: path") || stderr.contains("invalid object name") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// File names directly under `path` in the tree of `rev`.
    pub fn ls_tree(&self, rev: &str, path: &str) -> Result<Vec<String>, GitError> {
        match self.run(&["ls-tree", "--name-only", rev, "--", path]) {
            Ok(out) => Ok(String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::to_string)
                .collect()),
            Err(GitError::CommandFailed { stderr, .. })
                if stderr.contains("Not a valid object name") =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Local branch names.
    pub fn branches(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["for-each-ref", "refs/heads", "--format=%(refname:short)"])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Remote-tracking branch names, shorn of the `origin/` prefix.
    pub fn remote_branches(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&[
            "for-each-ref",
            "refs/remotes/origin",
            "--format=%(refname:short)",
        ])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.ends_with("/HEAD"))
            .filter_map(|l| l.strip_prefix("origin/"))
            .map(str::to_string)
            .collect())
    }

    /// Branch heads on the remote, from `ls-remote`.
    pub fn ls_remote_heads(&self) -> Result<Vec<String>, GitError> {
        let out = self.run(&["ls-remote", "--heads", "origin"])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.split('\t').nth(1))
            .filter_map(|r| r.strip_prefix("refs/heads/"))
            .map(str::to_string)
            .collect())
    }

    /// The sha the remote's default branch points at, if reachable.
    pub fn remote_head(&self) -> Result<Option<String>, GitError> {
        let out = self.run(&["ls-remote", "origin", "HEAD"])?;
        Ok(String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .next()
            .map(str::to_string))
    }

    fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        run_git(Some(&self.path), self.ssh_key_path.as_deref(), args)
    }
}

fn parse_log(stdout: &str) -> Vec<CommitInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let sha = parts.next()?.to_string();
            let created = parts.next()?.parse().ok()?;
            let message = parts.next().unwrap_or_default().to_string();
            Some(CommitInfo {
                sha,
                created,
                message,
            })
        })
        .collect()
}

fn run_git(
    cwd: Option<&Path>,
    ssh_key_path: Option<&Path>,
    args: &[&str],
) -> Result<Output, GitError> {
    let mut command = Command::new("git");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    if let Some(key) = ssh_key_path {
        command.env(
            "GIT_SSH_COMMAND",
            format!(
                "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
                key.display()
            ),
        );
    }
    command.args(args);

    debug!("running git {}", args.join(" "));
    let output = command.output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command: args.first().copied().unwrap_or("git").to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::fs;

    /// Initializes a repository with an `origin` remote pointing at a
    /// freshly created bare repository, so pushes work locally.
    pub fn init_with_bare_origin(dir: &Path) -> (Repo, PathBuf) {
        let bare = dir.join("origin.git");
        run_git(None, None, &["init", "--bare", "-b", "main", &bare.to_string_lossy()])
            .unwrap();

        let work = dir.join("work");
        let repo = Repo::init(&work).unwrap();
        repo.run(&["remote", "add", "origin", &bare.to_string_lossy()])
            .unwrap();
        (repo, bare)
    }

    pub fn commit_file(repo: &Repo, path: &str, content: &str, message: &str) -> String {
        let full = repo.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
        repo.add_all().unwrap();
        repo.commit(message).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_commit_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_with_bare_origin(dir.path());

        assert!(repo.is_clean().unwrap());

        let first = commit_file(&repo, "staging/my-app/file", "0\n", "first");
        let second = commit_file(&repo, "staging/my-app/file", "1\n", "second");
        commit_file(&repo, "staging/other/file", "x\n", "unrelated");

        let history = repo.log_touching("staging/my-app/").unwrap();
        assert_eq!(2, history.len());
        assert_eq!(second, history[0].sha);
        assert_eq!(first, history[1].sha);
        assert_eq!("second", history[0].message);

        let last = repo.last_commit_touching("staging/my-app/").unwrap().unwrap();
        assert_eq!(second, last.sha);
    }

    #[test]
    fn test_file_at_revision() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_with_bare_origin(dir.path());

        let first = commit_file(&repo, "staging/release.json", "{\"app\":\"a\"}\n", "first");
        commit_file(&repo, "staging/release.json", "{\"app\":\"b\"}\n", "second");

        let old = repo.file_at(&first, "staging/release.json").unwrap().unwrap();
        assert!(old.contains("\"a\""));
        assert!(repo.file_at(&first, "staging/missing.json").unwrap().is_none());
    }

    #[test]
    fn test_push_to_bare_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, bare) = init_with_bare_origin(dir.path());

        let sha = commit_file(&repo, "file", "content\n", "first");
        repo.push().unwrap();

        let origin = Repo::open(&bare, None);
        assert_eq!(sha, origin.head().unwrap());
    }

    #[test]
    fn test_revert_creates_revert_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_with_bare_origin(dir.path());

        commit_file(&repo, "file", "0\n", "zero");
        let one = commit_file(&repo, "file", "1\n", "one");
        repo.revert(&one).unwrap();

        let history = repo.log_touching("file").unwrap();
        assert_eq!(3, history.len());
        assert!(history[0].message.contains("Revert"));
        let content = std::fs::read_to_string(repo.path().join("file")).unwrap();
        assert_eq!("0\n", content);
    }
}

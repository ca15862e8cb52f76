//! # Git integration
//!
//! All git access goes through the command-line `git` binary: working
//! tree mutations, history walks and transport. SSH deploy keys are
//! passed via `GIT_SSH_COMMAND` so clones and pushes work against
//! locked-down gitops repositories.

pub mod cli;
pub mod gitops;
pub mod repo_cache;

pub use cli::{GitError, Repo};
pub use repo_cache::{ReadSnapshot, RepoCache};

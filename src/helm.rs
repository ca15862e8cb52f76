//! # Chart rendering
//!
//! Executes `helm template` and turns a manifest into the set of
//! Kubernetes YAML files to commit.
//!
//! Charts come from two kinds of sources:
//! - a chart repository reference (`chart.repository` + `chart.name` +
//!   `chart.version`)
//! - a git URL in `chart.name` (`git@host:org/repo.git?path=&sha=&tag=&branch=`),
//!   cloned into a throwaway directory for the duration of the render
//!
//! Rendering is client-only: no cluster is contacted, the release name is
//! the app name, CRDs are not included.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::dx::Manifest;
use crate::git::Repo;

const SOURCE_SEPARATOR: &str = "---\n# Source: ";

/// A chart hosted in a git repository, addressed through the chart name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitChartRef {
    pub url: String,
    pub path: String,
    pub sha: String,
    pub tag: String,
    pub branch: String,
}

/// Parses a git-hosted chart reference out of a chart name. Returns None
/// for plain chart-repository names.
pub fn parse_git_chart_ref(name: &str) -> Option<GitChartRef> {
    if !name.starts_with("git@") && !name.starts_with("ssh://") {
        return None;
    }

    let (url, query) = match name.split_once('?') {
        Some((url, query)) => (url.to_string(), query),
        None => (name.to_string(), ""),
    };

    let mut chart = GitChartRef {
        url,
        ..Default::default()
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "path" => chart.path = value.to_string(),
            "sha" => chart.sha = value.to_string(),
            "tag" => chart.tag = value.to_string(),
            "branch" => chart.branch = value.to_string(),
            _ => {}
        }
    }
    Some(chart)
}

/// Renders a manifest into one file per chart template.
///
/// The manifest's variables must already be resolved; rendering is a
/// pure function of the manifest, which is what makes retries after a
/// failed push safe.
pub fn template(
    manifest: &Manifest,
    chart_deploy_key_path: Option<&Path>,
) -> Result<BTreeMap<String, String>> {
    // The clone teardown rides on the TempDir guard.
    let mut _chart_dir_guard = None;

    let chart_ref = match parse_git_chart_ref(&manifest.chart.name) {
        Some(git_chart) => {
            let (guard, chart_path) = clone_chart_from_repo(&git_chart, chart_deploy_key_path)?;
            _chart_dir_guard = Some(guard);
            chart_path.to_string_lossy().into_owned()
        }
        None => manifest.chart.name.clone(),
    };

    let values_file = tempfile::Builder::new()
        .prefix("values-")
        .suffix(".yaml")
        .tempfile()
        .context("cannot create values file")?;
    let values_yaml =
        serde_yaml::to_string(&manifest.values).context("cannot serialize values")?;
    std::fs::write(values_file.path(), values_yaml).context("cannot write values file")?;

    let mut command = Command::new("helm");
    command
        .arg("template")
        .arg(&manifest.app)
        .arg(&chart_ref)
        .arg("--values")
        .arg(values_file.path());
    if !manifest.namespace.is_empty() {
        command.arg("--namespace").arg(&manifest.namespace);
    }
    if parse_git_chart_ref(&manifest.chart.name).is_none() {
        if !manifest.chart.repository.is_empty() {
            command.arg("--repo").arg(&manifest.chart.repository);
        }
        if !manifest.chart.version.is_empty() {
            command.arg("--version").arg(&manifest.chart.version);
        }
    }

    info!(
        "rendering chart {} for {}/{}",
        manifest.chart.name, manifest.env, manifest.app
    );
    let output = command.output().context("Failed to execute helm template")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("helm template failed: {}", stderr.trim());
    }

    let rendered =
        String::from_utf8(output.stdout).context("Failed to decode helm output as UTF-8")?;
    debug!("helm template succeeded, splitting output");

    let files = BTreeMap::from([("manifest.yaml".to_string(), rendered)]);
    Ok(split_rendered_output(files))
}

/// Clones the chart's git repository into a throwaway directory and
/// checks out what the query parameters ask for. Returns the guard
/// keeping the directory alive and the effective chart path inside it.
fn clone_chart_from_repo(
    chart: &GitChartRef,
    deploy_key_path: Option<&Path>,
) -> Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::Builder::new()
        .prefix("chart-git-")
        .tempdir()
        .context("cannot create chart clone dir")?;

    let repo = Repo::clone(
        &chart.url,
        dir.path(),
        deploy_key_path.map(Path::to_path_buf),
    )
    .with_context(|| format!("cannot clone chart git repo {}", chart.url))?;

    if !chart.sha.is_empty() {
        repo.checkout(&chart.sha)
            .with_context(|| format!("cannot checkout sha {}", chart.sha))?;
    }
    if !chart.tag.is_empty() {
        repo.checkout(&chart.tag)
            .with_context(|| format!("cannot checkout tag {}", chart.tag))?;
    }
    if !chart.branch.is_empty() {
        repo.checkout(&chart.branch)
            .with_context(|| format!("cannot checkout branch {}", chart.branch))?;
    }

    let chart_path = if chart.path.is_empty() {
        dir.path().to_path_buf()
    } else {
        dir.path().join(chart.path.trim_start_matches('/'))
    };

    Ok((dir, chart_path))
}

/// Splits helm's concatenated multi-file output into one entry per
/// source file, keyed by the final path segment. Multiple documents
/// from the same file stay together, separated by `---`.
pub fn split_rendered_output(input: BTreeMap<String, String>) -> BTreeMap<String, String> {
    if input.len() != 1 {
        return input;
    }

    let mut files = BTreeMap::new();
    for content in input.values() {
        if !content.contains(SOURCE_SEPARATOR) {
            return input.clone();
        }

        for part in content.split(SOURCE_SEPARATOR) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut lines = part.lines();
            let Some(file_path) = lines.next() else {
                continue;
            };
            let body = lines.collect::<Vec<&str>>().join("\n");
            let file_name = Path::new(file_path.trim())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.trim().to_string());

            files
                .entry(file_name)
                .and_modify(|existing: &mut String| {
                    existing.push_str("---\n");
                    existing.push_str(&body);
                    existing.push('\n');
                })
                .or_insert_with(|| format!("---\n{}\n", body));
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_git_chart_ref() {
        assert!(parse_git_chart_ref("onechart").is_none());

        let chart = parse_git_chart_ref(
            "git@github.com:acme/charts.git?path=/charts/onechart&sha=ea9ab7cc",
        )
        .unwrap();
        assert_eq!("git@github.com:acme/charts.git", chart.url);
        assert_eq!("/charts/onechart", chart.path);
        assert_eq!("ea9ab7cc", chart.sha);
        assert!(chart.tag.is_empty());

        let chart = parse_git_chart_ref("git@github.com:acme/charts.git?branch=main").unwrap();
        assert_eq!("main", chart.branch);

        let chart = parse_git_chart_ref("git@github.com:acme/charts.git").unwrap();
        assert_eq!("git@github.com:acme/charts.git", chart.url);
    }

    #[test]
    fn test_split_rendered_output() {
        let rendered = "---\n\
# Source: onechart/templates/deployment.yaml\n\
apiVersion: apps/v1\n\
kind: Deployment\n\
---\n\
# Source: onechart/templates/service.yaml\n\
apiVersion: v1\n\
kind: Service\n";

        let files = split_rendered_output(BTreeMap::from([(
            "manifest.yaml".to_string(),
            rendered.to_string(),
        )]));

        assert_eq!(2, files.len());
        assert!(files["deployment.yaml"].contains("kind: Deployment"));
        assert!(files["deployment.yaml"].starts_with("---\n"));
        assert!(files["service.yaml"].contains("kind: Service"));
    }

    #[test]
    fn test_split_keeps_documents_of_one_file_together() {
        let rendered = "---\n\
# Source: onechart/templates/rbac.yaml\n\
kind: Role\n\
---\n\
# Source: onechart/templates/rbac.yaml\n\
kind: RoleBinding\n";

        let files = split_rendered_output(BTreeMap::from([(
            "manifest.yaml".to_string(),
            rendered.to_string(),
        )]));

        assert_eq!(1, files.len());
        let rbac = &files["rbac.yaml"];
        assert!(rbac.contains("kind: Role"));
        assert!(rbac.contains("kind: RoleBinding"));
        assert_eq!(2, rbac.matches("---\n").count());
    }

    #[test]
    fn test_split_passes_through_unmarked_output() {
        let input = BTreeMap::from([(
            "manifest.yaml".to_string(),
            "apiVersion: v1\nkind: Service\n".to_string(),
        )]);
        assert_eq!(input, split_rendered_output(input.clone()));

        let multi = BTreeMap::from([
            ("a.yaml".to_string(), "kind: A\n".to_string()),
            ("b.yaml".to_string(), "kind: B\n".to_string()),
        ]);
        assert_eq!(multi, split_rendered_output(multi.clone()));
    }
}

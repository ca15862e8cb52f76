use serde::Serialize;

use crate::model::{
    GitopsCommit, HEALTH_CHECK_FAILED, PROGRESSING, RECONCILIATION_FAILED,
    RECONCILIATION_SUCCEEDED, VALIDATION_FAILED,
};
use crate::worker::events::{DeleteEvent, DeployEvent, RollbackEvent, Status};

/// A rendered Slack message: summary text plus layout blocks.
#[derive(Debug, Clone, Serialize)]
pub struct SlackMessage {
    pub text: String,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Text>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<Text>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Text {
    #[serde(rename = "type")]
    pub text_type: &'static str,
    pub text: String,
}

const SECTION: &str = "section";
const CONTEXT: &str = "context";
const MARKDOWN: &str = "mrkdwn";

fn section(text: &str) -> Block {
    Block {
        block_type: SECTION,
        text: Some(Text {
            text_type: MARKDOWN,
            text: text.to_string(),
        }),
        elements: Vec::new(),
    }
}

fn context(elements: Vec<String>) -> Block {
    Block {
        block_type: CONTEXT,
        text: None,
        elements: elements
            .into_iter()
            .map(|text| Text {
                text_type: MARKDOWN,
                text,
            })
            .collect(),
    }
}

/// Slack-markdown link to a commit on the gitops repository.
pub fn commit_link(gitops_repo: &str, sha: &str) -> String {
    let short = if sha.len() > 8 { &sha[..8] } else { sha };
    format!("<https://github.com/{}/commit/{}|{}>", gitops_repo, sha, short)
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One broadcastable notification.
#[derive(Debug, Clone)]
pub enum Message {
    Deploy(DeployEvent),
    Rollback(RollbackEvent),
    Delete(DeleteEvent),
    Flux {
        gitops_commit: GitopsCommit,
        gitops_repo: String,
        env: String,
    },
}

impl Message {
    pub fn flux(gitops_commit: GitopsCommit, gitops_repo: String, env: String) -> Message {
        Message::Flux {
            gitops_commit,
            gitops_repo,
            env,
        }
    }

    /// The environment this message belongs to, for channel routing.
    pub fn env(&self) -> &str {
        match self {
            Message::Deploy(event) => &event.manifest.env,
            Message::Rollback(event) => &event.rollback_request.env,
            Message::Delete(event) => &event.env,
            Message::Flux { env, .. } => env,
        }
    }

    /// Renders the Slack form of the message. Returns None when the
    /// message is suppressed (Progressing updates with
    /// `send_progressing` off).
    pub fn as_slack_message(&self, send_progressing: bool) -> Option<SlackMessage> {
        match self {
            Message::Deploy(event) => Some(deploy_message(event)),
            Message::Rollback(event) => Some(rollback_message(event)),
            Message::Delete(event) => Some(delete_message(event)),
            Message::Flux {
                gitops_commit,
                gitops_repo,
                ..
            } => flux_message(gitops_commit, gitops_repo, send_progressing),
        }
    }
}

fn deploy_message(event: &DeployEvent) -> SlackMessage {
    if event.status == Status::Failure {
        let text = format!(
            "Failed to roll out {} of {}",
            event.manifest.app, event.artifact.version.repository_name
        );
        SlackMessage {
            blocks: vec![
                section(&text),
                context(vec![format!(
                    ":exclamation: *Error* :exclamation: \n{}",
                    event.status_desc
                )]),
                context(vec![
                    format!(":dart: {}", title_case(&event.manifest.env)),
                    format!(":clipboard: {}", event.artifact.version.url),
                ]),
            ],
            text,
        }
    } else {
        let text = format!(
            "{} is rolling out {} on {}",
            event.triggered_by, event.manifest.app, event.artifact.version.repository_name
        );
        SlackMessage {
            blocks: vec![
                section(&text),
                context(vec![
                    format!(":dart: {}", title_case(&event.manifest.env)),
                    format!(":clipboard: {}", event.artifact.version.url),
                    format!(
                        ":paperclip: {}",
                        commit_link(&event.gitops_repo, &event.gitops_ref)
                    ),
                ]),
            ],
            text,
        }
    }
}

fn rollback_message(event: &RollbackEvent) -> SlackMessage {
    if event.status == Status::Failure {
        let text = format!(
            "Failed to roll back {} of {}",
            event.rollback_request.app, event.rollback_request.env
        );
        SlackMessage {
            blocks: vec![
                section(&text),
                context(vec![format!(
                    ":exclamation: *Error* :exclamation: \n{}",
                    event.status_desc
                )]),
                context(vec![
                    format!(":dart: {}", title_case(&event.rollback_request.env)),
                    format!(":clipboard: {}", event.rollback_request.target_sha),
                ]),
            ],
            text,
        }
    } else {
        let text = format!(
            "Rollback {} of {}",
            event.rollback_request.app, event.rollback_request.env
        );
        let mut elements = vec![
            format!(":dart: {}", title_case(&event.rollback_request.env)),
            format!(":clipboard: {}", event.rollback_request.target_sha),
        ];
        for gitops_ref in &event.gitops_refs {
            elements.push(format!(
                ":paperclip: {}",
                commit_link(&event.gitops_repo, gitops_ref)
            ));
        }
        elements.truncate(10);
        SlackMessage {
            blocks: vec![section(&text), context(elements)],
            text,
        }
    }
}

fn delete_message(event: &DeleteEvent) -> SlackMessage {
    let text = format!(
        "Policy based cleanup of {} on {}",
        event.app, event.env
    );
    let mut elements = vec![format!(":dart: {}", title_case(&event.env))];
    if let Some(gitops_ref) = &event.gitops_ref {
        elements.push(format!(
            ":paperclip: {}",
            commit_link(&event.gitops_repo, gitops_ref)
        ));
    }
    SlackMessage {
        blocks: vec![section(&text), context(elements)],
        text,
    }
}

fn flux_message(
    gitops_commit: &GitopsCommit,
    gitops_repo: &str,
    send_progressing: bool,
) -> Option<SlackMessage> {
    if gitops_commit.status == PROGRESSING && !send_progressing {
        return None;
    }

    let link = commit_link(gitops_repo, &gitops_commit.sha);
    let text = match gitops_commit.status.as_str() {
        PROGRESSING => format!(":hourglass_flowing_sand: Applying gitops changes from {}", link),
        RECONCILIATION_SUCCEEDED => format!(":heavy_check_mark: Gitops changes applied from {}", link),
        VALIDATION_FAILED | RECONCILIATION_FAILED => {
            format!(":exclamation: Gitops changes from {} failed to apply", link)
        }
        HEALTH_CHECK_FAILED => {
            format!(":ambulance: Gitops changes from {} have health issues", link)
        }
        other => format!("{}: {}", other, link),
    };

    let mut blocks = vec![section(&text)];
    let context_text = match gitops_commit.status.as_str() {
        VALIDATION_FAILED | RECONCILIATION_FAILED | HEALTH_CHECK_FAILED => {
            gitops_commit.status_desc.clone()
        }
        _ => String::new(),
    };
    if !context_text.is_empty() {
        blocks.push(context(vec![context_text]));
    }

    Some(SlackMessage { text, blocks })
}

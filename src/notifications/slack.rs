use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use super::{Block, Message, Provider};

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Delivers messages to Slack via `chat.postMessage`.
pub struct SlackProvider {
    token: String,
    default_channel: String,
    channel_mapping: HashMap<String, String>,
    send_progressing: bool,
    client: reqwest::Client,
}

impl std::fmt::Debug for SlackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackProvider")
            .field("default_channel", &self.default_channel)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
    blocks: &'a [Block],
}

impl SlackProvider {
    pub fn new(
        token: &str,
        default_channel: &str,
        channel_mapping: HashMap<String, String>,
        send_progressing: bool,
    ) -> SlackProvider {
        SlackProvider {
            token: token.to_string(),
            default_channel: default_channel.to_string(),
            channel_mapping,
            send_progressing,
            client: reqwest::Client::new(),
        }
    }

    fn channel_for(&self, env: &str) -> &str {
        self.channel_mapping
            .get(env)
            .map(String::as_str)
            .unwrap_or(&self.default_channel)
    }
}

#[async_trait]
impl Provider for SlackProvider {
    async fn send(&self, message: &Message) -> Result<()> {
        let Some(slack_message) = message.as_slack_message(self.send_progressing) else {
            return Ok(());
        };

        let channel = self.channel_for(message.env());
        debug!("sending slack message to {}", channel);

        let response = self
            .client
            .post(POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&PostMessageRequest {
                channel,
                text: &slack_message.text,
                blocks: &slack_message.blocks,
            })
            .send()
            .await
            .context("cannot reach slack")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("slack returned {}", status);
        }

        let body: serde_json::Value = response.json().await.context("cannot parse slack response")?;
        if !body["ok"].as_bool().unwrap_or(false) {
            anyhow::bail!(
                "slack rejected the message: {}",
                body["error"].as_str().unwrap_or("unknown error")
            );
        }

        Ok(())
    }
}

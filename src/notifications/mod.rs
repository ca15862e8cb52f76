//! # Notifications
//!
//! Broadcast of deploy, rollback, cleanup and reconciler-status messages
//! to configured providers.
//!
//! The broadcast channel never back-pressures producers: sends are
//! non-blocking and messages are dropped when the buffer is full. Each
//! provider delivery runs as its own task so a slow provider cannot
//! block the worker either.

mod messages;
mod slack;

pub use messages::{commit_link, Block, Message, SlackMessage, Text};
pub use slack::SlackProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

const BROADCAST_BUFFER: usize = 64;

#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, message: &Message) -> anyhow::Result<()>;
}

pub struct NotificationsManager {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    providers: Vec<Arc<dyn Provider>>,
}

impl std::fmt::Debug for NotificationsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationsManager")
            .field("providers", &self.providers.len())
            .finish_non_exhaustive()
    }
}

impl Default for NotificationsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationsManager {
    pub fn new() -> NotificationsManager {
        let (tx, rx) = mpsc::channel(BROADCAST_BUFFER);
        NotificationsManager {
            tx,
            rx: Mutex::new(rx),
            providers: Vec::new(),
        }
    }

    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Registers a Slack provider. The channel mapping routes messages
    /// per environment (`env=channel,env=channel`); everything else goes
    /// to the default channel.
    pub fn add_slack_provider(
        &mut self,
        token: &str,
        default_channel: &str,
        channel_mapping: &str,
        send_progressing: bool,
    ) {
        let channel_map = parse_channel_mapping(channel_mapping);
        self.add_provider(Arc::new(SlackProvider::new(
            token,
            default_channel,
            channel_map,
            send_progressing,
        )));
    }

    /// Queues a message for delivery. Never blocks; when the buffer is
    /// full the message is dropped.
    pub fn broadcast(&self, message: Message) {
        if self.tx.try_send(message).is_err() {
            warn!("notification buffer full, dropping message");
        }
    }

    /// Dispatch loop: fans every received message out to all providers
    /// concurrently.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("shutting down notifications manager");
                    return;
                }
                message = rx.recv() => {
                    let Some(message) = message else { return };
                    for provider in &self.providers {
                        let provider = Arc::clone(provider);
                        let message = message.clone();
                        tokio::spawn(async move {
                            if let Err(e) = provider.send(&message).await {
                                warn!("cannot send notification: {}", e);
                            }
                        });
                    }
                }
            }
        }
    }
}

fn parse_channel_mapping(channel_mapping: &str) -> HashMap<String, String> {
    let mut channel_map = HashMap::new();
    if channel_mapping.is_empty() {
        return channel_map;
    }
    for pair in channel_mapping.split(',') {
        if let Some((env, channel)) = pair.split_once('=') {
            channel_map.insert(env.trim().to_string(), channel.trim().to_string());
        }
    }
    channel_map
}

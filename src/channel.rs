//! Remote dictionary deployment channel.
//!
//! Dictionary artifacts (user words, stopwords) live as files on the search
//! nodes. A [`DictionaryChannel`] places them there and asks the nodes to
//! pick them up. The HTTP implementation talks to a command endpoint: it
//! submits a command, then polls its status with a fixed attempt budget and
//! linear backoff, failing permanently once the budget is spent.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DictionaryConfig;

/// One file to place on the search nodes.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DictionaryArtifact {
    /// Path relative to the nodes' config directory.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelOutcome {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait DictionaryChannel: Send + Sync {
    fn name(&self) -> &str;
    /// Push every artifact and wait for the nodes to acknowledge.
    async fn push(&self, artifacts: &[DictionaryArtifact]) -> Result<ChannelOutcome>;
}

/// Channel that deploys nothing and always succeeds.
pub struct DisabledChannel;

#[async_trait]
impl DictionaryChannel for DisabledChannel {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn push(&self, artifacts: &[DictionaryArtifact]) -> Result<ChannelOutcome> {
        Ok(ChannelOutcome {
            success: true,
            output: format!("skipped {} artifact(s); channel disabled", artifacts.len()),
        })
    }
}

/// Poll state reported by a command endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    Pending,
    Done(ChannelOutcome),
}

/// Call `check` until it reports [`PollState::Done`] or `max_attempts` calls
/// have been made. The wait before attempt `n` is `interval * n`.
pub async fn poll_until_complete<F, Fut>(
    max_attempts: u32,
    interval: Duration,
    mut check: F,
) -> Result<ChannelOutcome>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollState>>,
{
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(interval * (attempt - 1)).await;
        }
        match check(attempt).await? {
            PollState::Done(outcome) => return Ok(outcome),
            PollState::Pending => {
                tracing::debug!(attempt, max_attempts, "dictionary command still running");
            }
        }
    }
    bail!(
        "dictionary command did not complete after {} attempts",
        max_attempts
    )
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    action: &'static str,
    target_path: &'a str,
    files: &'a [DictionaryArtifact],
}

#[derive(Debug, Deserialize)]
struct CommandAccepted {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CommandStatus {
    status: String,
    #[serde(default)]
    output: String,
}

/// Channel backed by a node-agent command endpoint.
///
/// `POST {endpoint}/commands` submits the deployment and returns an id;
/// `GET {endpoint}/commands/{id}` reports `pending`, `running`, `success`
/// or `failed`.
pub struct HttpCommandChannel {
    client: reqwest::Client,
    endpoint: String,
    target_path: String,
    max_attempts: u32,
    poll_interval: Duration,
}

impl HttpCommandChannel {
    pub fn new(config: &DictionaryConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .context("dictionary.endpoint required for http channel")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            target_path: config.target_path.clone(),
            max_attempts: config.max_attempts,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        })
    }

    async fn check(&self, id: &str) -> Result<PollState> {
        let resp = self
            .client
            .get(format!("{}/commands/{}", self.endpoint, id))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("command status request failed: {}", resp.status());
        }
        let status: CommandStatus = resp.json().await?;
        Ok(parse_command_status(status))
    }
}

fn parse_command_status(status: CommandStatus) -> PollState {
    match status.status.to_ascii_lowercase().as_str() {
        "success" | "succeeded" | "completed" => PollState::Done(ChannelOutcome {
            success: true,
            output: status.output,
        }),
        "failed" | "error" | "cancelled" => PollState::Done(ChannelOutcome {
            success: false,
            output: status.output,
        }),
        _ => PollState::Pending,
    }
}

#[async_trait]
impl DictionaryChannel for HttpCommandChannel {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(&self, artifacts: &[DictionaryArtifact]) -> Result<ChannelOutcome> {
        let request = CommandRequest {
            action: "deploy_dictionaries",
            target_path: &self.target_path,
            files: artifacts,
        };
        let resp = self
            .client
            .post(format!("{}/commands", self.endpoint))
            .json(&request)
            .send()
            .await
            .context("failed to submit dictionary command")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("dictionary command rejected {}: {}", status, body);
        }
        let accepted: CommandAccepted = resp.json().await?;
        tracing::info!(command_id = %accepted.id, files = artifacts.len(), "dictionary command submitted");

        poll_until_complete(self.max_attempts, self.poll_interval, |_| {
            self.check(&accepted.id)
        })
        .await
    }
}

pub fn create_channel(config: &DictionaryConfig) -> Result<std::sync::Arc<dyn DictionaryChannel>> {
    match config.channel.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledChannel)),
        "http" => Ok(std::sync::Arc::new(HttpCommandChannel::new(config)?)),
        other => bail!("Unknown dictionary channel: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn poll_stops_at_first_terminal_state() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until_complete(5, Duration::ZERO, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(if attempt < 3 {
                    PollState::Pending
                } else {
                    PollState::Done(ChannelOutcome {
                        success: true,
                        output: "reloaded".into(),
                    })
                })
            }
        })
        .await
        .unwrap();
        assert!(outcome.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let err = poll_until_complete(4, Duration::ZERO, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollState::Pending) }
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("4 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn status_strings_map_to_states() {
        let done = parse_command_status(CommandStatus {
            status: "FAILED".into(),
            output: "disk full".into(),
        });
        assert_eq!(
            done,
            PollState::Done(ChannelOutcome {
                success: false,
                output: "disk full".into()
            })
        );
        let pending = parse_command_status(CommandStatus {
            status: "running".into(),
            output: String::new(),
        });
        assert_eq!(pending, PollState::Pending);
    }

    #[tokio::test]
    async fn disabled_channel_succeeds() {
        let outcome = DisabledChannel
            .push(&[DictionaryArtifact {
                path: "analysis/stopwords.txt".into(),
                content: "a\n".into(),
            }])
            .await
            .unwrap();
        assert!(outcome.success);
    }
}

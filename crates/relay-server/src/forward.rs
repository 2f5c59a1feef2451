use std::time::Duration;

use relay_config::Forward;
use relay_contracts::ForwardPayload;
use relay_kernel::retry_delay_with_jitter;
use reqwest::Client;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// No automation engine URL is configured.
    Skipped,
    Delivered { attempts: usize },
    Failed { attempts: usize, reason: String },
}

/// Posts enriched webhook events to the automation engine.
pub struct Forwarder {
    url: Option<String>,
    max_attempts: usize,
    jitter_ms: u64,
    client: Client,
}

impl Forwarder {
    pub fn new(cfg: &Forward) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            url: cfg.url.clone().filter(|v| !v.trim().is_empty()),
            max_attempts: cfg.max_attempts.max(1),
            jitter_ms: cfg.jitter_ms,
            client,
        })
    }

    pub async fn forward(&self, payload: &ForwardPayload) -> ForwardOutcome {
        let Some(url) = &self.url else {
            return ForwardOutcome::Skipped;
        };

        let mut last_failure = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                sleep(retry_delay_with_jitter(self.jitter_ms)).await;
            }
            match self.client.post(url).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    return ForwardOutcome::Delivered { attempts: attempt };
                }
                Ok(response) => {
                    last_failure = format!("automation engine returned {}", response.status());
                }
                Err(e) if e.is_timeout() => {
                    last_failure = "automation engine timed out".to_string();
                }
                Err(e) => {
                    last_failure = format!("automation engine unreachable: {e}");
                }
            }
            warn!(attempt, max_attempts = self.max_attempts, reason = %last_failure, "forward attempt failed");
        }

        ForwardOutcome::Failed {
            attempts: self.max_attempts,
            reason: last_failure,
        }
    }
}

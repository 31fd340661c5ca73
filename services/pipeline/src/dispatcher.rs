//! Explicit retry, timeout and dead-letter policy around handler invocations.
//!
//! Every inbound event goes through [`Dispatcher::dispatch`] exactly once per
//! delivery. The dispatcher owns the decision of what a failure means:
//!
//! - transient failures and timeouts are retried with exponential backoff
//!   until `max_attempts` is reached, then dead-lettered
//! - permanent failures are dead-lettered on the first attempt
//!
//! Dispatch reports an outcome rather than an error. A consumer may commit
//! its position past any outcome except [`DispatchOutcome::Undeliverable`],
//! where the dead-letter sink refused the event as well.

use crate::config::RetryConfig;
use crate::handler::{EventHandler, HandlerError};
use crate::store::StoreError;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// An event that could not be processed automatically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Handler that gave up
    pub handler: String,
    /// The event as JSON, or the raw payload when it could not be decoded
    pub payload: serde_json::Value,
    pub reason: String,
    pub attempts: u32,
    /// True when the failure was classified permanent rather than exhausted
    pub permanent: bool,
    pub failed_at: DateTime<Utc>,
}

/// Durable holding area for dead letters
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    DeadLettered { attempts: u32, reason: String },
    /// Handling failed and the dead-letter sink could not take the event
    Undeliverable {
        attempts: u32,
        reason: String,
        sink_error: String,
    },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }

    /// The event is neither handled nor parked anywhere durable.
    pub fn is_undeliverable(&self) -> bool {
        matches!(self, DispatchOutcome::Undeliverable { .. })
    }
}

/// Runs handlers under the configured retry policy
pub struct Dispatcher {
    retry: RetryConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl Dispatcher {
    pub fn new(retry: RetryConfig, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            retry,
            dead_letters,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.retry.initial_backoff(),
            initial_interval: self.retry.initial_backoff(),
            max_interval: self.retry.max_backoff(),
            multiplier: self.retry.multiplier,
            // Attempts are capped by count, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Deliver one event to one handler.
    pub async fn dispatch<E, H>(&self, handler: &H, event: &E) -> DispatchOutcome
    where
        E: Serialize + Send + Sync,
        H: EventHandler<E> + ?Sized,
    {
        let name = handler.name();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result =
                match tokio::time::timeout(self.retry.invocation_timeout(), handler.handle(event))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Transient(format!(
                        "invocation exceeded {}ms",
                        self.retry.invocation_timeout_ms
                    ))),
                };

            let err = match result {
                Ok(()) => {
                    debug!(handler = name, attempt, "Event handled");
                    metrics::counter!("pipeline.dispatch.delivered", "handler" => name)
                        .increment(1);
                    return DispatchOutcome::Delivered { attempts: attempt };
                }
                Err(err) => err,
            };

            if err.is_permanent() || attempt >= max_attempts {
                return self.give_up(name, event, err, attempt).await;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.retry.max_backoff());

            warn!(
                handler = name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, retrying"
            );
            metrics::counter!("pipeline.dispatch.retried", "handler" => name).increment(1);

            tokio::time::sleep(delay).await;
        }
    }

    async fn give_up<E: Serialize>(
        &self,
        name: &'static str,
        event: &E,
        err: HandlerError,
        attempts: u32,
    ) -> DispatchOutcome {
        let payload = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);

        error!(
            handler = name,
            attempts,
            permanent = err.is_permanent(),
            error = %err,
            "Routing event to dead-letter sink"
        );

        let letter = DeadLetter {
            handler: name.to_string(),
            payload,
            reason: err.reason().to_string(),
            attempts,
            permanent: err.is_permanent(),
            failed_at: Utc::now(),
        };

        match self.send_dead_letter(letter).await {
            Ok(()) => DispatchOutcome::DeadLettered {
                attempts,
                reason: err.reason().to_string(),
            },
            Err(sink_err) => DispatchOutcome::Undeliverable {
                attempts,
                reason: err.reason().to_string(),
                sink_error: sink_err.to_string(),
            },
        }
    }

    /// Dead-letter a payload that never became an event (e.g. undecodable bytes).
    pub async fn dead_letter_raw(
        &self,
        handler: &str,
        payload: &[u8],
        reason: &str,
    ) -> Result<(), StoreError> {
        let payload = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) => value,
            Err(_) => serde_json::json!({ "rawBase64": BASE64_STANDARD.encode(payload) }),
        };

        self.send_dead_letter(DeadLetter {
            handler: handler.to_string(),
            payload,
            reason: reason.to_string(),
            attempts: 0,
            permanent: true,
            failed_at: Utc::now(),
        })
        .await
    }

    async fn send_dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let handler = letter.handler.clone();

        match self.dead_letters.dead_letter(letter).await {
            Ok(()) => {
                metrics::counter!("pipeline.dispatch.dead_lettered", "handler" => handler)
                    .increment(1);
                Ok(())
            }
            Err(e) => {
                error!(handler = %handler, error = %e, "Failed to write dead letter");
                metrics::counter!("pipeline.dispatch.dead_letter_failed").increment(1);
                Err(e)
            }
        }
    }
}

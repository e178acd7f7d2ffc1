//! Reconnect policy and the subscription task shared by entities and
//! collections.
//!
//! A subscription runs as one tokio task: connect, drain the stream, and on
//! failure sleep for the current back-off before reconnecting. The reconnect
//! timer lives inside the task, so aborting the task also cancels any pending
//! reconnect.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_RETRY_CEILING_MS;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// A single failure is terminal.
    Disabled,
    /// Reconnect after `initial`, doubling on each consecutive failure.
    Backoff { initial: Duration },
}

impl RetryPolicy {
    /// `0` or any negative value disables retrying.
    pub fn from_millis(millis: i64) -> Self {
        if millis <= 0 {
            RetryPolicy::Disabled
        } else {
            RetryPolicy::Backoff {
                initial: Duration::from_millis(millis as u64),
            }
        }
    }
}

/// Escalating reconnect delay for one subscription cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, ceiling: Duration) -> Self {
        let current = match policy {
            RetryPolicy::Disabled => Duration::ZERO,
            RetryPolicy::Backoff { initial } => initial,
        };
        Self {
            policy,
            current,
            ceiling,
        }
    }

    pub fn with_default_ceiling(policy: RetryPolicy) -> Self {
        Self::new(policy, Duration::from_millis(DEFAULT_RETRY_CEILING_MS))
    }

    /// Delay before the next reconnect, or `None` once retrying is over.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy == RetryPolicy::Disabled || self.current > self.ceiling {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2);
        Some(delay)
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Retrying,
    /// Back-off exhausted or retrying disabled; dead until restarted.
    Failed,
}

/// One live feed driven by [`SubscriptionTask`].
#[async_trait]
pub(crate) trait Subscriber: Send + Sync + 'static {
    type Item: Send + 'static;

    fn label(&self) -> String;

    async fn connect(&self) -> SyncResult<BoxStream<'static, SyncResult<Self::Item>>>;

    /// Record a state transition. Returns `false` once this subscriber has
    /// been superseded, which ends the task without further side effects.
    fn set_state(&self, state: SubscriptionState) -> bool;

    fn deliver(&mut self, item: Self::Item) -> ControlFlow<()>;
}

/// Handle to a running subscription. Dropping it aborts the task.
#[derive(Debug)]
pub(crate) struct SubscriptionTask {
    handle: JoinHandle<()>,
}

impl SubscriptionTask {
    pub(crate) fn spawn<S: Subscriber>(subscriber: S, backoff: Backoff) -> Self {
        Self {
            handle: tokio::spawn(run_subscription(subscriber, backoff)),
        }
    }

    #[cfg(test)]
    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for SubscriptionTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_subscription<S: Subscriber>(mut subscriber: S, mut backoff: Backoff) {
    let label = subscriber.label();
    loop {
        if !subscriber.set_state(SubscriptionState::Connecting) {
            return;
        }

        let failure = match subscriber.connect().await {
            Ok(mut stream) => {
                if !subscriber.set_state(SubscriptionState::Listening) {
                    return;
                }
                debug!(subscription = %label, "Listening");
                loop {
                    match stream.next().await {
                        Some(Ok(item)) => {
                            if subscriber.deliver(item).is_break() {
                                return;
                            }
                        }
                        Some(Err(e)) => break e,
                        None => break SyncError::transport("subscription stream closed"),
                    }
                }
            }
            Err(e) => e,
        };

        match backoff.next_delay() {
            Some(delay) => {
                if !subscriber.set_state(SubscriptionState::Retrying) {
                    return;
                }
                warn!(
                    subscription = %label,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Listen failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                subscriber.set_state(SubscriptionState::Failed);
                error!(subscription = %label, error = %failure, "Listen failed, giving up");
                return;
            }
        }
    }
}

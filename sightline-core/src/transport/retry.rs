//! Retrying delivery with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::scheduler::SharedScheduler;

use super::http::{check_status, HttpSender};
use super::{DeliveryGate, InFlight, Request, Transport, TransportKind};

/// Upper bound on a single backoff delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

const JITTER_MIN: f64 = 0.85;
const JITTER_MAX: f64 = 1.15;

/// How often and how patiently a failed request is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further one
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        if !config.enable_retries {
            return Self::none();
        }
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay_duration(),
            max_delay: MAX_RETRY_DELAY,
        }
    }

    /// Total attempts for one request
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`, jittered by ±15%
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        self.base_delay(retry).mul_f64(jitter).min(self.max_delay)
    }
}

/// Async request transport that reads the response and retries transient
/// failures.
///
/// Before every attempt the delivery gate is consulted; once it closes
/// (opt-out) no further request for the payload is made.
#[derive(Clone)]
pub struct RetryingTransport {
    sender: Arc<dyn HttpSender>,
    scheduler: SharedScheduler,
    policy: RetryPolicy,
    gate: Arc<dyn DeliveryGate>,
    in_flight: Arc<InFlight>,
}

impl RetryingTransport {
    pub fn new(
        sender: Arc<dyn HttpSender>,
        scheduler: SharedScheduler,
        policy: RetryPolicy,
        gate: Arc<dyn DeliveryGate>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            sender,
            scheduler,
            policy,
            gate,
            in_flight,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Deliver `request`, returning the number of attempts it took
    pub async fn deliver(&self, request: &Request) -> Result<u32> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            if !self.gate.is_open() {
                return Err(Error::Suppressed(
                    "tracking stopped before delivery".to_string(),
                ));
            }

            attempt += 1;
            let outcome = match self.sender.post_json(&request.url, &request.body).await {
                Ok(status) => check_status(status),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    tracing::debug!(
                        channel = %request.channel,
                        attempt,
                        max_attempts,
                        ?delay,
                        error = %e,
                        "transient delivery failure, retrying"
                    );
                    self.scheduler.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for RetryingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Retrying
    }

    fn dispatch(&self, request: Request) -> Result<()> {
        let guard = self.in_flight.begin();
        let transport = self.clone();
        self.scheduler.spawn(
            async move {
                let _guard = guard;
                match transport.deliver(&request).await {
                    Ok(attempts) => tracing::debug!(
                        channel = %request.channel,
                        items = request.items,
                        attempts,
                        "delivered"
                    ),
                    Err(Error::Suppressed(reason)) => tracing::debug!(
                        channel = %request.channel,
                        items = request.items,
                        reason = %reason,
                        "delivery abandoned"
                    ),
                    Err(e) => tracing::warn!(
                        channel = %request.channel,
                        items = request.items,
                        error = %e,
                        "delivery failed, dropping payload"
                    ),
                }
            }
            .boxed(),
        );
        Ok(())
    }
}

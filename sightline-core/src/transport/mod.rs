//! Delivery of payloads to the collector
//!
//! Two [`Transport`] strategies share one [`HttpSender`]:
//!
//! - [`RetryingTransport`] for in-page flushes: reads the response, retries
//!   network failures, 5xx and 429 with backoff, drops everything else.
//! - [`BeaconTransport`] for flushes triggered by the page going away: one
//!   detached attempt, never awaited by the caller.
//!
//! The [`Dispatcher`] picks between them from the flush reason, encodes the
//! payload and builds the endpoint URL. Every failure stops at this layer.

mod beacon;
mod http;
mod retry;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use url::Url;

use crate::error::{Error, Result};
use crate::event::Channel;
use crate::queue::{BatchSink, FlushReason};

pub use beacon::{BeaconTransport, BEACON_MAX_BYTES};
pub use http::{check_status, HttpSender, ReqwestSender, CLIENT_ID_HEADER, DEFAULT_TIMEOUT};
pub use retry::{RetryPolicy, RetryingTransport, MAX_RETRY_DELAY};

/// Reported to the collector as `sdk_name`
pub const SDK_NAME: &str = "sightline-rs";
/// Reported to the collector as `sdk_version`
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// An encoded payload bound for one endpoint
#[derive(Debug, Clone)]
pub struct Request {
    pub channel: Channel,
    pub url: Url,
    pub body: String,
    /// Events in the payload
    pub items: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Retrying,
    Beacon,
}

/// A delivery strategy
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start delivering `request` and return without waiting for it
    fn dispatch(&self, request: Request) -> Result<()>;
}

/// Whether delivery may still go ahead
pub trait DeliveryGate: Send + Sync {
    fn is_open(&self) -> bool;
}

impl<F> DeliveryGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_open(&self) -> bool {
        self()
    }
}

/// Counts deliveries that have been dispatched but not finished
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delivery; it ends when the guard drops
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight. `false` if `timeout` ran out first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.notify.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

/// Marks one in-flight delivery
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.notify.notify_waiters();
        }
    }
}

/// Builds requests and routes them to the right transport
pub struct Dispatcher {
    api_url: String,
    client_id: String,
    retrying: RetryingTransport,
    beacon: BeaconTransport,
}

impl Dispatcher {
    pub fn new(
        api_url: impl Into<String>,
        client_id: impl Into<String>,
        retrying: RetryingTransport,
        beacon: BeaconTransport,
    ) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            retrying,
            beacon,
        }
    }

    /// Endpoint for `channel`, with the identifying query parameters
    pub fn endpoint(&self, channel: Channel, batch: bool) -> Result<Url> {
        let path = if batch {
            channel.batch_path()
        } else {
            channel.single_path()
        };
        let mut url = Url::parse(&format!("{}{}", self.api_url, path))
            .map_err(|e| Error::Config(format!("invalid collector url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("sdk_name", SDK_NAME)
            .append_pair("sdk_version", SDK_VERSION);
        Ok(url)
    }

    /// Encode `payload` and hand it to the transport chosen for `reason`
    pub fn send<P: Serialize + ?Sized>(
        &self,
        channel: Channel,
        payload: &P,
        items: usize,
        batch: bool,
        reason: FlushReason,
    ) {
        let request = match self.request(channel, payload, items, batch) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "failed to build request, dropping payload");
                return;
            }
        };

        let outcome = if reason.is_terminal() {
            match self.beacon.dispatch(request.clone()) {
                Err(Error::PayloadTooLarge { size, limit }) => {
                    tracing::debug!(size, limit, "payload too large for beacon, sending as request");
                    self.retrying.dispatch(request)
                }
                other => other,
            }
        } else {
            self.retrying.dispatch(request)
        };

        if let Err(e) = outcome {
            tracing::warn!(channel = %channel, error = %e, "failed to dispatch payload");
        }
    }

    fn request<P: Serialize + ?Sized>(
        &self,
        channel: Channel,
        payload: &P,
        items: usize,
        batch: bool,
    ) -> Result<Request> {
        Ok(Request {
            channel,
            url: self.endpoint(channel, batch)?,
            body: serde_json::to_string(payload)?,
            items,
        })
    }
}

/// [`BatchSink`] posting to one collector channel
pub struct ChannelSink {
    channel: Channel,
    dispatcher: Arc<Dispatcher>,
}

impl ChannelSink {
    pub fn new(channel: Channel, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            channel,
            dispatcher,
        }
    }
}

impl<T: Serialize + Send> BatchSink<T> for ChannelSink {
    fn send_single(&self, item: T, reason: FlushReason) {
        self.dispatcher.send(self.channel, &item, 1, false, reason);
    }

    fn send_batch(&self, items: Vec<T>, reason: FlushReason) {
        self.dispatcher
            .send(self.channel, &items, items.len(), true, reason);
    }
}

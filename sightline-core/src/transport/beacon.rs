//! Fire-and-forget delivery for payloads sent while the page goes away

use std::sync::Arc;

use futures::FutureExt;

use crate::error::{Error, Result};
use crate::scheduler::SharedScheduler;

use super::http::{check_status, HttpSender};
use super::{DeliveryGate, InFlight, Request, Transport, TransportKind};

/// Largest body the beacon transport accepts
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

/// Single detached attempt; the response is never read by the caller.
///
/// `dispatch` returns as soon as the request is queued, so it is safe to
/// call from an unload handler. Oversized bodies are refused with
/// [`Error::PayloadTooLarge`] so the caller can fall back. The delivery gate
/// is checked once more right before the request goes out.
#[derive(Clone)]
pub struct BeaconTransport {
    sender: Arc<dyn HttpSender>,
    scheduler: SharedScheduler,
    gate: Arc<dyn DeliveryGate>,
    in_flight: Arc<InFlight>,
}

impl BeaconTransport {
    pub fn new(
        sender: Arc<dyn HttpSender>,
        scheduler: SharedScheduler,
        gate: Arc<dyn DeliveryGate>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            sender,
            scheduler,
            gate,
            in_flight,
        }
    }
}

impl Transport for BeaconTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Beacon
    }

    fn dispatch(&self, request: Request) -> Result<()> {
        if request.body.len() > BEACON_MAX_BYTES {
            return Err(Error::PayloadTooLarge {
                size: request.body.len(),
                limit: BEACON_MAX_BYTES,
            });
        }

        let guard = self.in_flight.begin();
        let sender = Arc::clone(&self.sender);
        let gate = Arc::clone(&self.gate);
        self.scheduler.spawn(
            async move {
                let _guard = guard;
                if !gate.is_open() {
                    tracing::debug!(
                        channel = %request.channel,
                        items = request.items,
                        "beacon abandoned, tracking stopped"
                    );
                    return;
                }
                let outcome = match sender.post_json(&request.url, &request.body).await {
                    Ok(status) => check_status(status),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    tracing::debug!(channel = %request.channel, error = %e, "beacon not accepted");
                }
            }
            .boxed(),
        );
        Ok(())
    }
}

//! Correlation of twin requests with their `$rid`-tagged responses.
//!
//! Each in-flight twin operation owns one slot: a single-buffered channel
//! keyed by request id. The subscription handler delivers into the slot
//! without blocking; the requesting task waits on the other end with a
//! deadline and a cancellation signal. Slots are removed by the requester
//! on every exit path, never by the delivery side.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, TransportError};

/// Deadline for a twin response to arrive.
pub(crate) const TWIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded twin response. `version` is present on PATCH responses only.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TwinResponse {
    pub code: u16,
    pub body: Bytes,
    pub version: Option<u64>,
}

#[derive(Default)]
struct SlotTable {
    /// One-shot latch: the `$iothub/twin/res/#` subscription is installed.
    subscribed: bool,
    slots: HashMap<u32, mpsc::Sender<TwinResponse>>,
}

/// Request-id allocation and reply-slot bookkeeping for one session.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    next_rid: AtomicU32,
    table: RwLock<SlotTable>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id and registers its reply slot.
    ///
    /// Ids are strictly increasing over the session; behavior past 2^32
    /// allocations is unspecified.
    pub async fn begin(&self) -> (u32, mpsc::Receiver<TwinResponse>) {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(1);
        self.table.write().await.slots.insert(rid, tx);
        (rid, rx)
    }

    /// Removes the reply slot. A response arriving afterwards is dropped
    /// by `deliver`.
    pub async fn end(&self, rid: u32) {
        self.table.write().await.slots.remove(&rid);
    }

    /// Best-effort delivery into the slot for `rid`.
    ///
    /// Never blocks: the slot buffers one response, so a full slot can
    /// only mean a duplicate response for the same rid.
    pub async fn deliver(&self, rid: u32, resp: TwinResponse) {
        let table = self.table.read().await;
        let Some(slot) = table.slots.get(&rid) else {
            warn!(rid, "twin response for unknown request id, dropping");
            return;
        };
        match slot.try_send(resp) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(rid, "duplicate twin response, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(rid, "twin response arrived after the waiter left, dropping");
            }
        }
    }

    /// Installs the twin-response subscription at most once per session.
    ///
    /// The latch is checked and flipped under the table's write lock, so
    /// concurrent first requests cannot double-subscribe. `subscribe` is
    /// only polled when the latch is unset.
    pub async fn ensure_subscribed<Fut>(&self, subscribe: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>>,
    {
        let mut table = self.table.write().await;
        if table.subscribed {
            return Ok(());
        }
        subscribe.await?;
        table.subscribed = true;
        Ok(())
    }

    #[cfg(test)]
    pub async fn slot_count(&self) -> usize {
        self.table.read().await.slots.len()
    }
}

/// Waits for the reply, the 30 s deadline, or cancellation, whichever
/// fires first. Removing the slot remains the caller's responsibility.
pub(crate) async fn await_response(
    rx: &mut mpsc::Receiver<TwinResponse>,
    cancel: &CancellationToken,
) -> Result<TwinResponse> {
    tokio::select! {
        resp = rx.recv() => match resp {
            Some(resp) if (200..300).contains(&resp.code) => Ok(resp),
            Some(resp) => Err(TransportError::RequestFailed { code: resp.code }),
            // The sender lives in the slot table until the caller removes
            // it, so a closed channel can only follow a torn-down session.
            None => Err(TransportError::Timeout),
        },
        _ = tokio::time::sleep(TWIN_RESPONSE_TIMEOUT) => Err(TransportError::Timeout),
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
    }
}

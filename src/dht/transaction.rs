use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::trace;

use super::error::DhtError;
use super::message::{Response, TransactionId};

/// Where the outcome of a query is delivered. Sending consumes the sender,
/// so a transaction can only ever be resolved once.
pub type ReplySender = oneshot::Sender<Result<Response, DhtError>>;

const MAX_TRACKED_DESTINATIONS: usize = 65536;

struct Pending {
    reply: ReplySender,
    timer: Option<AbortHandle>,
}

/// Outstanding queries, keyed by destination and transaction id.
///
/// Ids are allocated from a per-destination counter that wraps at 2^16 and
/// skips ids still pending for that destination.
#[derive(Default)]
pub struct TransactionManager {
    next_ids: HashMap<SocketAddr, TransactionId>,
    pending: HashMap<(SocketAddr, TransactionId), Pending>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, addr: SocketAddr, tid: TransactionId) -> bool {
        self.pending.contains_key(&(addr, tid))
    }

    /// Registers a new transaction towards `addr` and returns its id. The
    /// reply is handed back if every id for that destination is in use.
    pub fn begin(
        &mut self,
        addr: SocketAddr,
        reply: ReplySender,
    ) -> Result<TransactionId, ReplySender> {
        let start = self.next_ids.get(&addr).copied().unwrap_or(0);
        let mut tid = start;
        while self.pending.contains_key(&(addr, tid)) {
            tid = tid.wrapping_add(1);
            if tid == start {
                return Err(reply);
            }
        }

        self.next_ids.insert(addr, tid.wrapping_add(1));
        self.pending.insert(
            (addr, tid),
            Pending {
                reply,
                timer: None,
            },
        );
        self.prune_counters();
        Ok(tid)
    }

    /// Attaches the timeout task of a transaction so it can be cancelled on
    /// resolution.
    pub fn arm(&mut self, addr: SocketAddr, tid: TransactionId, timer: AbortHandle) {
        match self.pending.get_mut(&(addr, tid)) {
            Some(pending) => pending.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Delivers a response or error. Returns false when nothing was waiting
    /// for this `(addr, tid)`.
    pub fn resolve(
        &mut self,
        addr: SocketAddr,
        tid: TransactionId,
        result: Result<Response, DhtError>,
    ) -> bool {
        let Some(pending) = self.pending.remove(&(addr, tid)) else {
            return false;
        };

        if let Some(timer) = pending.timer {
            timer.abort();
        }

        if pending.reply.send(result).is_err() {
            trace!("reply for transaction {} to {} dropped by caller", tid, addr);
        }
        true
    }

    /// Fails a transaction whose timer fired.
    pub fn expire(&mut self, addr: SocketAddr, tid: TransactionId) -> bool {
        self.resolve(addr, tid, Err(DhtError::Timeout))
    }

    /// Drops every pending transaction without invoking its reply and
    /// cancels all timers.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        self.next_ids.clear();
    }

    /// Counters outlive their transactions so late replies cannot match a
    /// reused id; they are only pruned once too many destinations pile up.
    fn prune_counters(&mut self) {
        if self.next_ids.len() <= MAX_TRACKED_DESTINATIONS {
            return;
        }
        let pending = &self.pending;
        self.next_ids
            .retain(|addr, _| pending.keys().any(|(a, _)| a == addr));
    }
}

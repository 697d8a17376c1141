//! A hashmap for correlating in-flight requests with their responses.

use std::fmt::{self, Debug, Formatter};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::channel::oneshot;
use serde_json::Value;
use tracing::warn;

use crate::error::ServerError;

/// What a request ultimately resolved to on the wire: a result value or the
/// server's error object.
pub(crate) type ResponseOutcome = Result<Value, ServerError>;

/// Requests that have been written to the server and are awaiting an answer,
/// keyed by the pool's integer request ID.
///
/// Every slot leaves the map in exactly one of three ways: the matching
/// response arrives ([`Pending::complete`]), the caller gives up
/// ([`Pending::forget`], on deadline or cancellation), or the connection dies
/// ([`Pending::drain`], which wakes every waiter with a dropped-sender
/// signal).
pub(crate) struct Pending(DashMap<i64, oneshot::Sender<ResponseOutcome>>);

impl Pending {
    pub(crate) fn new() -> Self {
        Pending(DashMap::new())
    }

    /// Opens a slot for the given request ID and returns the receiver that
    /// resolves once the matching response arrives.
    ///
    /// Must be called *before* the request frame hits the wire, otherwise a
    /// fast server could answer into the void.
    ///
    /// # Panics
    ///
    /// Panics if the ID is already pending. This cannot happen as long as a
    /// monotonically increasing ID is used per connection.
    pub(crate) fn wait(&self, id: i64) -> oneshot::Receiver<ResponseOutcome> {
        match self.0.entry(id) {
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                rx
            }
            _ => panic!("request ID {} reused while still pending, this is a bug", id),
        }
    }

    /// Delivers a response outcome to its waiter, if one still exists.
    ///
    /// Answers for unknown IDs (e.g. ones that arrive after their deadline
    /// already fired) are dropped with a log line.
    pub(crate) fn complete(&self, id: i64, outcome: ResponseOutcome) {
        match self.0.remove(&id) {
            // The waiter may have raced its own removal; a send failure here
            // just means the response is late and gets discarded.
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => warn!("received response with unknown request ID: {}", id),
        }
    }

    /// Releases the slot for the given ID without delivering anything.
    pub(crate) fn forget(&self, id: i64) {
        self.0.remove(&id);
    }

    /// Fails every pending request by dropping its sender; waiters observe a
    /// cancellation and report the connection as lost.
    pub(crate) fn drain(&self) {
        let count = self.0.len();
        self.0.retain(|_, _| false);
        if count > 0 {
            warn!("connection closed with {} request(s) still pending", count);
        }
    }

    /// Number of requests currently awaiting a response.
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl Debug for Pending {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_set()
            .entries(self.0.iter().map(|entry| *entry.key()))
            .finish()
    }
}

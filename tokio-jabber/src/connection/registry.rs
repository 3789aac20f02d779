//! Registrants awaiting incoming stanzas.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::Error;
use crate::stanza::StanzaTree;

/// Callback invoked with each dispatched stanza.
///
/// The callback claims a stanza by calling [`StanzaTree::consume`]. It runs
/// while the connection is locked and must therefore return quickly and
/// never block on the connection itself.
pub type StanzaCallback = Box<dyn FnMut(&StanzaTree) + Send>;

pub(super) type Waiter = oneshot::Sender<Result<(), Error>>;

struct Handler {
    token: u64,
    callback: StanzaCallback,
    waiter: Option<Waiter>,
    stale: Arc<AtomicBool>,
}

impl Handler {
    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn complete(mut self, result: Result<(), Error>) {
        if let Some(waiter) = self.waiter.take() {
            // The caller may have given up already.
            let _ = waiter.send(result);
        }
    }
}

/// One-shot response handlers, then named filters.
#[derive(Default)]
pub(super) struct Registry {
    handlers: Vec<Handler>,
    filters: Vec<(String, StanzaCallback)>,
}

impl Registry {
    pub(super) fn add_handler(
        &mut self,
        token: u64,
        callback: StanzaCallback,
        waiter: Waiter,
        stale: Arc<AtomicBool>,
    ) {
        self.handlers.push(Handler {
            token,
            callback,
            waiter: Some(waiter),
            stale,
        });
    }

    /// Drop a handler without waking its waiter.
    pub(super) fn remove_handler(&mut self, token: u64) {
        self.handlers.retain(|h| h.token != token);
    }

    /// Register `callback` under `name`, replacing the callback of an
    /// existing filter in place.
    pub(super) fn add_filter(&mut self, name: String, callback: StanzaCallback) {
        match self.filters.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = callback,
            None => self.filters.push((name, callback)),
        }
    }

    pub(super) fn remove_filter(&mut self, name: &str) -> bool {
        let before = self.filters.len();
        self.filters.retain(|(n, _)| n != name);
        self.filters.len() != before
    }

    fn prune(&mut self) {
        self.handlers.retain(|h| !h.is_stale());
    }

    /// Whether a dispatch would reach nobody. Prunes stale handlers.
    pub(super) fn is_empty(&mut self) -> bool {
        self.prune();
        self.handlers.is_empty() && self.filters.is_empty()
    }

    /// Offer `stanza` to the handlers, then to the filters, until one of
    /// them consumes it. A consuming handler is removed and its waiter woken.
    pub(super) fn dispatch(&mut self, stanza: &StanzaTree) {
        self.prune();

        let mut i = 0;
        while i < self.handlers.len() {
            let handler = &mut self.handlers[i];
            if handler.is_stale() {
                i += 1;
                continue;
            }
            invoke(&mut handler.callback, stanza, "response handler");
            if stanza.is_consumed() {
                log::trace!(
                    "<{}/> consumed by response handler #{}",
                    stanza.name(),
                    handler.token
                );
                self.handlers.remove(i).complete(Ok(()));
                return;
            }
            i += 1;
        }

        for (name, callback) in self.filters.iter_mut() {
            invoke(callback, stanza, name);
            if stanza.is_consumed() {
                log::trace!("<{}/> consumed by filter {:?}", stanza.name(), name);
                return;
            }
        }

        log::trace!("<{}/> was not consumed", stanza.name());
    }

    /// Remove every handler and release its waiter with
    /// [`Error::Disconnected`].
    pub(super) fn release_all(&mut self) {
        for handler in self.handlers.drain(..) {
            handler.complete(Err(Error::Disconnected));
        }
    }
}

fn invoke(callback: &mut StanzaCallback, stanza: &StanzaTree, who: &str) {
    if catch_unwind(AssertUnwindSafe(|| callback(stanza))).is_err() {
        log::error!("{} panicked while handling <{}/>", who, stanza.name());
    }
}

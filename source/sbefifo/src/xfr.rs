//! Transfers and the transfer queue
//!
//! A transfer is one request/response round trip. Transfers sit in two
//! orderings at once: the device-wide service queue, which the poller works
//! through strictly first-in first-out, and the list of the client that
//! submitted them, which the client's reads and writes walk oldest first.
//!
//! Nothing in here is synchronized. [`Transfers`] lives inside the device
//! state and is only touched with the device lock held.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use crate::buf::Rings;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub(crate) struct XfrId(u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct ClientId(pub(crate) u64);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum XfrState {
    /// Not serviced yet. The writer may still be filling its ring, and
    /// `write_done` records whether it has handed over its last word.
    Queued { write_done: bool },
    /// At the device, writer still producing.
    WriteDraining,
    /// The writer is finished. Once the ring is drained, EOT is raised.
    WriteDone,
    /// EOT was raised, filling the read ring from the device. The deadline
    /// is armed on the first stall and cleared whenever data shows up.
    ResponsePending { wait_deadline: Option<Instant> },
    /// The response marker was seen and acknowledged.
    Complete,
    /// No response data arrived in time.
    TimedOut,
}

impl XfrState {
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self, XfrState::Complete | XfrState::TimedOut)
    }

    /// Has the response side begun (or ended)?
    pub(crate) fn has_response(&self) -> bool {
        matches!(
            self,
            XfrState::ResponsePending { .. } | XfrState::Complete | XfrState::TimedOut
        )
    }

    /// The writer has committed its last word.
    pub(crate) fn finish_write(&mut self) {
        match self {
            XfrState::Queued { write_done } => *write_done = true,
            XfrState::WriteDraining => *self = XfrState::WriteDone,
            _ => {}
        }
    }

    /// The transfer reached the head of the queue.
    pub(crate) fn start(&mut self) {
        if let XfrState::Queued { write_done } = *self {
            *self = if write_done {
                XfrState::WriteDone
            } else {
                XfrState::WriteDraining
            };
        }
    }
}

pub(crate) struct Xfr {
    pub(crate) client: ClientId,
    pub(crate) rings: Arc<Rings>,
    pub(crate) state: XfrState,
    /// The client gave up on this transfer. Orthogonal to `state`: a
    /// cancelled transfer that already reached the device is still walked to
    /// a terminal state, against scratch rings.
    pub(crate) cancelled: bool,
    /// `rings` no longer points at the client's rings.
    pub(crate) scratch: bool,
}

struct ClientEntry {
    xfrs: VecDeque<XfrId>,
    open: bool,
}

#[derive(Default)]
pub(crate) struct Transfers {
    next_id: u64,
    queue: VecDeque<XfrId>,
    xfrs: HashMap<XfrId, Xfr>,
    clients: HashMap<ClientId, ClientEntry>,
}

impl Transfers {
    pub(crate) fn register_client(&mut self, client: ClientId) {
        self.clients.insert(
            client,
            ClientEntry {
                xfrs: VecDeque::new(),
                open: true,
            },
        );
    }

    /// Queues a new transfer at the tail of the service queue and of the
    /// client's own list.
    pub(crate) fn enqueue(&mut self, client: ClientId, rings: Arc<Rings>) -> XfrId {
        let id = XfrId(self.next_id);
        self.next_id += 1;
        self.xfrs.insert(
            id,
            Xfr {
                client,
                rings,
                state: XfrState::Queued { write_done: false },
                cancelled: false,
                scratch: false,
            },
        );
        self.queue.push_back(id);
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.xfrs.push_back(id);
        }
        id
    }

    pub(crate) fn get(&self, id: XfrId) -> Option<&Xfr> {
        self.xfrs.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: XfrId) -> Option<&mut Xfr> {
        self.xfrs.get_mut(&id)
    }

    /// The client's oldest outstanding transfer.
    pub(crate) fn oldest(&self, client: ClientId) -> Option<XfrId> {
        self.clients.get(&client)?.xfrs.front().copied()
    }

    pub(crate) fn oldest_state(&self, client: ClientId) -> Option<XfrState> {
        self.oldest(client)
            .and_then(|id| self.get(id))
            .map(|xfr| xfr.state)
    }

    /// Owner of the next transfer the poller will service, ignoring
    /// cancelled transfers that will be skipped.
    pub(crate) fn head_client(&self) -> Option<ClientId> {
        self.queue
            .iter()
            .filter_map(|id| self.xfrs.get(id))
            .find(|xfr| !(xfr.cancelled && matches!(xfr.state, XfrState::Queued { .. })))
            .map(|xfr| xfr.client)
    }

    /// Number of transfers waiting for, or receiving, device service.
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The transfer to service next. Cancelled transfers that never reached
    /// the device are dropped on the way, wherever they sit in the queue.
    pub(crate) fn next_xfr(&mut self) -> Option<XfrId> {
        let stale: Vec<XfrId> = self
            .queue
            .iter()
            .copied()
            .filter(|id| {
                self.xfrs.get(id).map_or(true, |xfr| {
                    xfr.cancelled && matches!(xfr.state, XfrState::Queued { .. })
                })
            })
            .collect();
        for id in stale {
            tracing::trace!(xfr = ?id, "discarding cancelled transfer");
            self.forget(id);
        }
        self.queue.front().copied()
    }

    pub(crate) fn finish_write(&mut self, id: XfrId) {
        if let Some(xfr) = self.xfrs.get_mut(&id) {
            xfr.state.finish_write();
        }
    }

    /// The transfer reached a terminal state and leaves the service queue.
    /// A cancelled transfer has nobody left to consume it and is dropped.
    pub(crate) fn finish(&mut self, id: XfrId) {
        self.queue.retain(|&q| q != id);
        if self.xfrs.get(&id).map_or(false, |xfr| xfr.cancelled) {
            self.forget(id);
        }
    }

    /// The client has read everything it is going to get from `id`.
    pub(crate) fn consume(&mut self, id: XfrId) {
        self.forget(id);
    }

    /// Cancels one transfer on behalf of its client. A transfer the device
    /// never saw is dropped right away, and any words it staged are thrown
    /// out with it. Returns `true` if the poller still has to drain it.
    pub(crate) fn cancel(&mut self, id: XfrId) -> bool {
        let Some(xfr) = self.xfrs.get_mut(&id) else {
            return false;
        };
        if xfr.state.is_finished() {
            return false;
        }
        if matches!(xfr.state, XfrState::Queued { .. }) {
            xfr.rings.wbuf.reset();
            self.forget(id);
            return false;
        }
        xfr.cancelled = true;
        true
    }

    /// The client is going away. Its finished transfers are dropped and the
    /// rest are cancelled. The client entry lingers until the poller has
    /// drained every cancelled transfer. Returns `true` if the poller has
    /// work to do.
    pub(crate) fn release_client(&mut self, client: ClientId) -> bool {
        let Some(entry) = self.clients.get_mut(&client) else {
            return false;
        };
        entry.open = false;
        let ids: Vec<XfrId> = entry.xfrs.iter().copied().collect();

        let mut pending = false;
        for id in ids {
            if self.xfrs.get(&id).map_or(false, |xfr| xfr.state.is_finished()) {
                self.forget(id);
            } else {
                pending |= self.cancel(id);
            }
        }
        self.reap(client);
        pending
    }

    /// Drops every transfer. Used when the device dies.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.xfrs.clear();
        for entry in self.clients.values_mut() {
            entry.xfrs.clear();
        }
        self.clients.retain(|_, entry| entry.open);
    }

    #[cfg(test)]
    pub(crate) fn clients(&self) -> usize {
        self.clients.len()
    }

    fn forget(&mut self, id: XfrId) {
        self.queue.retain(|&q| q != id);
        let Some(xfr) = self.xfrs.remove(&id) else {
            return;
        };
        if let Some(entry) = self.clients.get_mut(&xfr.client) {
            entry.xfrs.retain(|&x| x != id);
        }
        self.reap(xfr.client);
    }

    fn reap(&mut self, client: ClientId) {
        if let Some(entry) = self.clients.get(&client) {
            if !entry.open && entry.xfrs.is_empty() {
                self.clients.remove(&client);
            }
        }
    }
}

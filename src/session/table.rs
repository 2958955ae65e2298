//! Fixed-capacity session registry.
//!
//! Heavy per-connection state (the socket, tokenizer, request, response)
//! stays task-local, owned directly by the session's dispatch task — there is
//! no reason to share what only one task ever touches. What genuinely needs to be shared
//! is the small slice other code cares about: LRU bookkeeping for admission,
//! and the handful of fields `get_client_list`/`sess_set_ctx` expose to
//! outside callers. That slice is [`SessionHandle`]; the dispatch task holds
//! its own `Rc` clone independent of the table, so the table is only ever
//! locked for the brief, synchronous spans admission/removal/introspection
//! need — never across an `.await`.

use std::{any::Any, cell::Cell, cell::RefCell, net::SocketAddr, rc::Rc, time::Instant};

/// Lightweight, shared handle for one active session.
pub(crate) struct SessionHandle {
    pub(crate) peer_addr: SocketAddr,
    pub(crate) connected_at: Instant,
    pub(crate) is_websocket: Cell<bool>,

    /// Per-session user state set via `sess_set_ctx`/`sess_get_ctx`.
    pub(crate) user_ctx: RefCell<Option<Box<dyn Any>>>,

    /// Monotonically increasing stamp bumped whenever the session finishes a
    /// request and goes idle; the lowest stamp among idle slots is the LRU
    /// eviction candidate.
    touch: Cell<u64>,

    /// Set while parsing a request or running a handler. Only slots where
    /// this is `false` are eviction candidates.
    in_flight: Cell<bool>,

    /// Set when this handle is chosen as an eviction victim; the owning
    /// dispatch task polls this between requests and closes the connection
    /// instead of waiting on its next read.
    closing: Cell<bool>,
}

impl SessionHandle {
    fn new(peer_addr: SocketAddr, touch: u64) -> Rc<Self> {
        Rc::new(Self {
            peer_addr,
            connected_at: Instant::now(),
            is_websocket: Cell::new(false),
            user_ctx: RefCell::new(None),
            touch: Cell::new(touch),
            in_flight: Cell::new(false),
            closing: Cell::new(false),
        })
    }

    #[inline]
    pub(crate) fn set_in_flight(&self, value: bool) {
        self.in_flight.set(value);
    }

    #[inline]
    pub(crate) fn busy(&self) -> bool {
        self.in_flight.get()
    }

    #[inline]
    pub(crate) fn request_close(&self) {
        self.closing.set(true);
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.get()
    }
}

pub(crate) struct SessionTable {
    slots: Vec<Option<Rc<SessionHandle>>>,
    capacity: usize,
    clock: u64,
    lru_purge_enable: bool,
}

/// Why admission failed.
pub(crate) enum AdmissionError {
    Full,
}

pub(crate) struct Admitted {
    pub(crate) index: usize,
    pub(crate) handle: Rc<SessionHandle>,
    /// The peer that was evicted to make room, if any.
    pub(crate) evicted: Option<SocketAddr>,
}

impl SessionTable {
    pub(crate) fn new(capacity: usize, lru_purge_enable: bool) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots,
            capacity,
            clock: 0,
            lru_purge_enable,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Admits a new session, evicting the idle slot with the oldest touch
    /// stamp if the table is full and `lru_purge_enable` is set. The evicted
    /// handle is marked `closing`; its owning task notices on its own time
    /// and tears itself down (see [`remove_if_current`](Self::remove_if_current)).
    pub(crate) fn admit(&mut self, peer_addr: SocketAddr) -> Result<Admitted, AdmissionError> {
        if let Some(index) = self.slots.iter().position(|s| s.is_none()) {
            let stamp = self.next_stamp();
            let handle = SessionHandle::new(peer_addr, stamp);
            self.slots[index] = Some(Rc::clone(&handle));
            return Ok(Admitted { index, handle, evicted: None });
        }

        if !self.lru_purge_enable {
            return Err(AdmissionError::Full);
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Some(h) if !h.busy() => Some((i, h.touch.get())),
                _ => None,
            })
            .min_by_key(|&(_, touch)| touch)
            .map(|(i, _)| i)
            .ok_or(AdmissionError::Full)?;

        let evicted_addr = self.slots[victim].as_ref().map(|h| {
            h.request_close();
            h.peer_addr
        });

        let stamp = self.next_stamp();
        let handle = SessionHandle::new(peer_addr, stamp);
        self.slots[victim] = Some(Rc::clone(&handle));

        Ok(Admitted { index: victim, handle, evicted: evicted_addr })
    }

    /// Bumps the LRU stamp for `index` after a session finishes a request
    /// and returns to waiting.
    pub(crate) fn bump_touch(&mut self, index: usize) {
        let stamp = self.next_stamp();
        if let Some(Some(handle)) = self.slots.get(index) {
            handle.touch.set(stamp);
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<Rc<SessionHandle>> {
        self.slots.get(index)?.clone()
    }

    /// Clears `index` only if it still holds `handle` — guards against a
    /// task that was evicted (and whose slot was already reused) from
    /// wiping out the new occupant when it finally notices and tears down.
    pub(crate) fn remove_if_current(&mut self, index: usize, handle: &Rc<SessionHandle>) {
        if let Some(slot) = self.slots.get_mut(index) {
            if matches!(slot, Some(current) if Rc::ptr_eq(current, handle)) {
                *slot = None;
            }
        }
    }

    /// Iterates live sessions, for `get_client_list`-style introspection.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Rc<SessionHandle>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|h| (i, h)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn admits_into_empty_slots_first() {
        let mut table = SessionTable::new(2, true);

        let a = table.admit(addr(1)).ok().unwrap();
        let b = table.admit(addr(2)).ok().unwrap();

        assert_ne!(a.index, b.index);
        assert!(a.evicted.is_none());
        assert!(b.evicted.is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn refuses_when_full_and_purge_disabled() {
        let mut table = SessionTable::new(1, false);
        table.admit(addr(1)).ok().unwrap();

        assert!(matches!(table.admit(addr(2)), Err(AdmissionError::Full)));
    }

    #[test]
    fn evicts_oldest_idle_slot_when_purge_enabled() {
        let mut table = SessionTable::new(1, true);
        let first = table.admit(addr(1)).ok().unwrap();

        let second = table.admit(addr(2)).ok().unwrap();
        assert_eq!(first.index, second.index);
        assert_eq!(second.evicted, Some(addr(1)));
        assert!(first.handle.is_closing());
    }

    #[test]
    fn busy_slots_are_never_eviction_candidates() {
        let mut table = SessionTable::new(1, true);
        let first = table.admit(addr(1)).ok().unwrap();
        first.handle.set_in_flight(true);

        assert!(matches!(table.admit(addr(2)), Err(AdmissionError::Full)));
    }

    #[test]
    fn remove_if_current_ignores_a_slot_already_reused() {
        let mut table = SessionTable::new(1, true);
        let first = table.admit(addr(1)).ok().unwrap();
        let second = table.admit(addr(2)).ok().unwrap();
        assert_eq!(first.index, second.index);

        table.remove_if_current(first.index, &first.handle);
        assert_eq!(table.len(), 1);
        assert!(Rc::ptr_eq(&table.get(second.index).unwrap(), &second.handle));

        table.remove_if_current(second.index, &second.handle);
        assert_eq!(table.len(), 0);
    }
}

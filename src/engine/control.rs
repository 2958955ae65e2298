//! Control plane: the channel and event-bit group through which code running
//! on other OS threads reaches into the single-threaded engine.
//!
//! Two primitives: a `stop` bit signaled through [`EventGroup`], and a queue
//! of boxed closures the engine drains between readiness iterations. The event
//! group is `Arc`-shared rather than `Rc`-shared — unlike the rest of the
//! engine, [`ControlHandle`] genuinely crosses thread boundaries, so it needs
//! its one piece of shared state (`AtomicU32` + `Notify`, both already
//! `Send + Sync`) to tolerate that honestly rather than working around it.

use crate::{
    session::table::SessionTable,
    sync::event_group::EventGroup,
    uri::handlers::{boxed_registration, BoxedErrHandler, ErrCode, ErrHandlerTable, HandlerTable, RegisterError},
    Handled, Method, Request, Response, SessionContext,
};
use std::{cell::RefCell, future::Future, net::SocketAddr, rc::Rc, sync::Arc};

pub(crate) const STOP_BIT: u32 = 1 << 0;

/// A unit of work queued from another thread via `queue_work`, run on the
/// engine thread with read access to session/handler state. Must be `Send`
/// since it crosses a real thread boundary to get here; it may not capture
/// anything `!Send`, which rules out capturing engine-internal `Rc`s.
type WorkItem = Box<dyn FnOnce(&EngineContext) + Send + 'static>;

/// Read-only view of engine state passed into queued work and exposed to
/// `get_client_list`. Lives only as long as the call that receives it.
pub struct EngineContext<'a> {
    pub(crate) table: &'a Rc<RefCell<SessionTable>>,
    pub(crate) handlers: &'a Rc<RefCell<HandlerTable>>,
    pub(crate) err_handlers: &'a Rc<RefCell<ErrHandlerTable>>,
}

/// A snapshot entry for `get_client_list`.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub peer_addr: SocketAddr,
    pub is_websocket: bool,
}

impl<'a> EngineContext<'a> {
    pub(crate) fn client_list(&self) -> Vec<ClientInfo> {
        self.table
            .borrow()
            .iter()
            .map(|(_, handle)| ClientInfo {
                peer_addr: handle.peer_addr,
                is_websocket: handle.is_websocket.get(),
            })
            .collect()
    }

    pub fn get_client_list(&self) -> Vec<ClientInfo> {
        self.client_list()
    }

    pub fn register_uri_handler<F, Fut>(&self, method: Method, uri: &str, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(&Request, &mut Response, &mut SessionContext<'_>) -> Fut + 'static,
        Fut: Future<Output = Handled> + 'static,
    {
        self.handlers.borrow_mut().register(boxed_registration(method, uri, None, handler))
    }

    pub fn unregister_uri_handler(&self, method: Method, uri: &str) -> bool {
        self.handlers.borrow_mut().unregister(method, uri.as_bytes())
    }

    pub fn unregister_uri(&self, uri: &str) -> usize {
        self.handlers.borrow_mut().unregister_uri(uri.as_bytes())
    }

    pub fn register_err_handler<F>(&self, code: ErrCode, handler: F)
    where
        F: Fn(&Request, &mut Response) -> Handled + 'static,
    {
        let boxed: BoxedErrHandler = Rc::new(handler);
        self.err_handlers.borrow_mut().register(code, boxed);
    }
}

/// Engine-side half: owns the receiver and the event group the accept loop
/// polls every iteration.
pub(crate) struct ControlPlane {
    pub(crate) events: Arc<EventGroup>,
    receiver: crossbeam::channel::Receiver<WorkItem>,
}

/// Caller-side half, cloned freely across threads: everything needed to
/// signal `stop` or enqueue work without touching engine-private state.
#[derive(Clone)]
pub struct ControlHandle {
    events: Arc<EventGroup>,
    sender: crossbeam::channel::Sender<WorkItem>,
}

pub(crate) fn control_pair() -> (ControlPlane, ControlHandle) {
    let (sender, receiver) = crossbeam::channel::unbounded();
    let events = Arc::new(EventGroup::new());

    (
        ControlPlane { events: Arc::clone(&events), receiver },
        ControlHandle { events, sender },
    )
}

impl ControlPlane {
    /// Drains every queued closure without blocking.
    pub(crate) fn drain(&self, ctx: &EngineContext<'_>) {
        while let Ok(work) = self.receiver.try_recv() {
            work(ctx);
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.events.get() & STOP_BIT != 0
    }
}

impl ControlHandle {
    /// Idempotent: signaling an already-stopped engine is a no-op bit-set.
    pub fn stop(&self) {
        self.events.set(STOP_BIT);
    }

    /// Enqueues `work` for the engine thread. Silently dropped if the engine
    /// has already shut down and stopped draining its queue.
    pub fn queue_work<F>(&self, work: F)
    where
        F: FnOnce(&EngineContext<'_>) + Send + 'static,
    {
        let _ = self.sender.send(Box::new(work));
    }
}

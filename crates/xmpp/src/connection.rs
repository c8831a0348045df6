use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tern_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType};

use crate::{
    error::{ConnectionError, XmppError, describe_stanza_error},
    handler::{HandlerOptions, HandlerRef, HandlerRegistry, Matcher},
    jid::{BareJid, Jid, parse_jid},
    plugin::PluginLifecycle,
    session::{ConnectionState, LogInRequest},
    stanza::{
        Stanza, StanzaBuilder, StanzaExt, build_iq_error, parse_stanza, plain_stanza_error,
        serialize_stanza,
    },
    transport::XmppTransport,
};

const UNMATCHED_CAPACITY: usize = 64;

/// A single XMPP session over a pluggable transport.
///
/// Cheap to clone; every clone drives the same session. Handler closures
/// should capture a [`WeakConnection`] instead to avoid keeping the session
/// alive through its own registry.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

struct Inner {
    transport: Arc<dyn XmppTransport>,
    handlers: HandlerRegistry,
    plugins: RwLock<Vec<Arc<dyn PluginLifecycle>>>,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    user_jid: watch::Sender<Option<Jid>>,
    unmatched: broadcast::Sender<Stanza>,
    event_bus: Option<Arc<dyn EventBus>>,
    id_prefix: String,
    next_id: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tasks) = shared.session.take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

/// Drops the pending entry when the waiting future goes away first, for
/// example under a timeout.
struct PendingGuard<'a> {
    connection: &'a Connection,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.connection.lock_shared().pending.remove(&self.id).is_some() {
            trace!(id = %self.id, "abandoned request removed");
        }
    }
}

/// Session bookkeeping guarded by one lock, so a state transition and the
/// routing of an inbound response never interleave.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) pending: HashMap<String, PendingRequest>,
    pub(crate) session: Option<SessionTasks>,
    /// Bumped on every login attempt and teardown; stale tasks compare it.
    pub(crate) epoch: u64,
    pub(crate) credentials: Option<LogInRequest>,
}

pub(crate) struct PendingRequest {
    name: String,
    /// The request's `to`; only that entity may answer.
    to: Option<String>,
    responder: oneshot::Sender<Result<Stanza, XmppError>>,
}

impl PendingRequest {
    pub(crate) fn reject(self, error: XmppError) {
        let _ = self.responder.send(Err(error));
    }
}

pub(crate) struct SessionTasks {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SessionTasks {
    /// Stop both tasks and wait until they are gone.
    pub(crate) async fn shutdown(self) {
        drop(self.outbound);
        self.reader.abort();
        self.writer.abort();
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

struct Outbound {
    payload: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

impl Connection {
    pub fn new<T: XmppTransport>(transport: T) -> Self {
        Self::build(Arc::new(transport), None)
    }

    pub fn with_event_bus<T: XmppTransport>(transport: T, event_bus: Arc<dyn EventBus>) -> Self {
        Self::build(Arc::new(transport), Some(event_bus))
    }

    fn build(transport: Arc<dyn XmppTransport>, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (user_jid, _) = watch::channel(None);
        let (unmatched, _) = broadcast::channel(UNMATCHED_CAPACITY);
        let mut id_prefix = Uuid::new_v4().simple().to_string();
        id_prefix.truncate(8);

        Self {
            inner: Arc::new(Inner {
                transport,
                handlers: HandlerRegistry::new(),
                plugins: RwLock::new(Vec::new()),
                shared: Mutex::new(Shared::default()),
                state,
                user_jid,
                unmatched,
                event_bus,
                id_prefix,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attach a plugin. It takes part from the next login on.
    pub fn add_plugin(&self, plugin: Arc<dyn PluginLifecycle>) {
        debug!(plugin = plugin.name(), "plugin added");
        self.inner
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plugin);
    }

    pub(crate) fn plugins(&self) -> Vec<Arc<dyn PluginLifecycle>> {
        self.inner
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Observable state ──────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The full JID bound by the server, once authenticated.
    pub fn user_jid(&self) -> Option<Jid> {
        self.inner.user_jid.borrow().clone()
    }

    pub fn subscribe_user_jid(&self) -> watch::Receiver<Option<Jid>> {
        self.inner.user_jid.subscribe()
    }

    pub async fn wait_for_user_jid(&self) -> Result<Jid, XmppError> {
        let mut receiver = self.inner.user_jid.subscribe();
        let jid = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| XmppError::ConnectionLost)?
            .clone();
        jid.ok_or(XmppError::ConnectionLost)
    }

    /// Inbound stanzas no handler and no pending request claimed.
    pub fn subscribe_unmatched(&self) -> broadcast::Receiver<Stanza> {
        self.inner.unmatched.subscribe()
    }

    // ── Handlers ──────────────────────────────────────────────────

    pub fn add_handler<F>(&self, callback: F, matcher: Matcher, options: HandlerOptions) -> HandlerRef
    where
        F: Fn(&Stanza) -> bool + Send + Sync + 'static,
    {
        self.inner.handlers.add(callback, matcher, options)
    }

    pub fn delete_handler(&self, handle: HandlerRef) -> bool {
        self.inner.handlers.remove(handle)
    }

    // ── Outbound ──────────────────────────────────────────────────

    pub fn iq(&self, attrs: &[(&str, &str)]) -> StanzaBuilder {
        StanzaBuilder::bound(self.downgrade(), "iq", attrs)
    }

    pub fn message(&self, attrs: &[(&str, &str)]) -> StanzaBuilder {
        StanzaBuilder::bound(self.downgrade(), "message", attrs)
    }

    pub fn presence(&self, attrs: &[(&str, &str)]) -> StanzaBuilder {
        StanzaBuilder::bound(self.downgrade(), "presence", attrs)
    }

    /// Queue a stanza and wait until the transport accepted it.
    pub async fn send(&self, stanza: Stanza) -> Result<(), XmppError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(&stanza, Some(done_tx))?;
        done_rx
            .await
            .map_err(|_| XmppError::ConnectionLost)?
            .map_err(XmppError::from)
    }

    /// Queue a stanza without waiting; for use inside synchronous handlers.
    /// Ordering relative to other sends is preserved.
    pub fn send_detached(&self, stanza: Stanza) -> Result<(), XmppError> {
        self.enqueue(&stanza, None)
    }

    /// Send a request and wait for the response carrying the same id.
    ///
    /// Any `id` on the stanza is replaced. A response of type `error`
    /// resolves to [`XmppError::Protocol`]; losing the session resolves to
    /// [`XmppError::ConnectionLost`].
    pub async fn send_awaiting_response(&self, mut stanza: Stanza) -> Result<Stanza, XmppError> {
        let id = self.next_request_id();
        stanza.set_attr("id", id.as_str());
        if stanza.attr("from").is_none() {
            if let Some(jid) = self.user_jid() {
                stanza.set_attr("from", jid.to_string());
            }
        }
        let payload = serialize_stanza(&stanza)?;

        let (responder, response) = oneshot::channel();
        {
            let mut shared = self.lock_shared();
            let outbound = shared
                .session
                .as_ref()
                .map(|tasks| tasks.outbound.clone())
                .ok_or(XmppError::NotConnected)?;
            shared.pending.insert(
                id.clone(),
                PendingRequest {
                    name: stanza.name().to_string(),
                    to: stanza.attr("to").map(str::to_string),
                    responder,
                },
            );
            if outbound.send(Outbound { payload, done: None }).is_err() {
                shared.pending.remove(&id);
                return Err(XmppError::NotConnected);
            }
        }
        trace!(id = %id, name = stanza.name(), "awaiting response");

        let _guard = PendingGuard {
            connection: self,
            id,
        };
        response.await.map_err(|_| XmppError::ConnectionLost)?
    }

    /// Requests still waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        self.lock_shared().pending.len()
    }

    fn enqueue(
        &self,
        stanza: &Stanza,
        done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    ) -> Result<(), XmppError> {
        let payload = serialize_stanza(stanza)?;
        let shared = self.lock_shared();
        let tasks = shared.session.as_ref().ok_or(XmppError::NotConnected)?;
        tasks
            .outbound
            .send(Outbound { payload, done })
            .map_err(|_| XmppError::NotConnected)
    }

    fn next_request_id(&self) -> String {
        let sequence = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}:{sequence}", self.inner.id_prefix)
    }

    // ── Events ────────────────────────────────────────────────────

    /// Publish on the connection's event bus, if it has one.
    pub fn publish(&self, channel_name: &str, source: EventSource, payload: EventPayload) {
        let Some(event_bus) = &self.inner.event_bus else {
            return;
        };

        let channel = match Channel::new(channel_name) {
            Ok(channel) => channel,
            Err(error) => {
                warn!(%error, "dropping event for invalid channel");
                return;
            }
        };

        if let Err(error) = event_bus.publish(Event::new(channel, source, payload)) {
            warn!(%error, channel = channel_name, "failed to publish event");
        }
    }

    pub(crate) fn emit_event(&self, channel_name: &str, payload: EventPayload) {
        self.publish(channel_name, EventSource::Xmpp, payload);
    }

    // ── Session plumbing ──────────────────────────────────────────

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn XmppTransport> {
        &self.inner.transport
    }

    /// Apply a state transition. Callers hold the shared lock.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let current = self.state();
        if current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            warn!(
                from = current.as_str(),
                to = next.as_str(),
                "ignoring illegal connection state transition"
            );
            return false;
        }

        self.inner.state.send_replace(next);
        debug!(from = current.as_str(), to = next.as_str(), "connection state changed");
        self.emit_event(
            "system.connection.state",
            EventPayload::ConnectionStateChanged {
                state: next.as_str().to_string(),
            },
        );
        true
    }

    pub(crate) fn set_user_jid(&self, jid: Option<Jid>) {
        self.inner.user_jid.send_replace(jid);
    }

    pub(crate) fn spawn_session(&self, epoch: u64) -> SessionTasks {
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(
            self.downgrade(),
            self.inner.transport.clone(),
            queue,
            epoch,
        ));
        let reader = tokio::spawn(read_loop(
            self.downgrade(),
            self.inner.transport.clone(),
            epoch,
        ));
        SessionTasks {
            outbound,
            reader,
            writer,
        }
    }

    fn spawn_failure_handling(&self, epoch: u64, error: ConnectionError) {
        let connection = self.clone();
        tokio::spawn(async move {
            connection.handle_transport_failure(epoch, error).await;
        });
    }

    // ── Inbound ───────────────────────────────────────────────────

    pub(crate) fn handle_frame(&self, frame: &[u8]) {
        let stanza = match parse_stanza(frame) {
            Ok(stanza) => stanza,
            Err(error) => {
                warn!(%error, "dropping unparseable inbound frame");
                return;
            }
        };
        debug!(
            name = stanza.name(),
            id = ?stanza.stanza_id(),
            stanza_type = ?stanza.stanza_type(),
            from = ?stanza.attr("from"),
            "stanza received"
        );

        if self.resolve_pending(&stanza) {
            return;
        }

        let outcome = self.inner.handlers.dispatch(&stanza);
        if outcome.matched == 0 {
            self.on_unmatched(stanza);
        }
    }

    fn resolve_pending(&self, stanza: &Stanza) -> bool {
        let Some(id) = stanza.stanza_id() else {
            return false;
        };
        let own = self.user_jid();
        let from = stanza.attr("from");
        let request = {
            let mut shared = self.lock_shared();
            let Some(request) = shared.pending.get(id) else {
                return false;
            };
            if !answers(&request.name, stanza) {
                return false;
            }
            if !sent_by_addressee(request.to.as_deref(), from, own.as_ref()) {
                warn!(id, from = ?from, to = ?request.to, "ignoring response from unexpected sender");
                return false;
            }
            shared.pending.remove(id)
        };
        let Some(request) = request else {
            return false;
        };

        let response = match stanza.stanza_error() {
            Some(error) => {
                debug!(id, error = %describe_stanza_error(&error), "request rejected by peer");
                Err(XmppError::Protocol(error))
            }
            None => Ok(stanza.clone()),
        };
        let _ = request.responder.send(response);
        true
    }

    fn on_unmatched(&self, stanza: Stanza) {
        debug!(name = stanza.name(), id = ?stanza.stanza_id(), "no handler matched stanza");

        if stanza.name() == "iq" && matches!(stanza.stanza_type(), Some("get" | "set")) {
            let reply = build_iq_error(
                &stanza,
                &plain_stanza_error(ErrorType::Cancel, DefinedCondition::ServiceUnavailable),
            );
            if let Err(error) = self.send_detached(reply) {
                warn!(%error, "failed to reject unhandled iq");
            }
        }

        self.emit_event(
            "xmpp.stanza.unmatched",
            EventPayload::StanzaUnmatched {
                stanza: String::from(&stanza),
            },
        );
        let _ = self.inner.unmatched.send(stanza);
    }
}

/// Whether `response` answers a pending request for a `request_name` stanza.
fn answers(request_name: &str, response: &Stanza) -> bool {
    match response.name() {
        "iq" => request_name == "iq" && matches!(response.stanza_type(), Some("result" | "error")),
        name => name == request_name,
    }
}

/// Whether a response `from` may answer a request sent to `to`.
///
/// A request with a `to` must be answered by exactly that address. One
/// without a `to` went to the account itself, so the server may answer with
/// no `from` at all, or as the user's full JID, bare JID or domain.
fn sent_by_addressee(to: Option<&str>, from: Option<&str>, own: Option<&Jid>) -> bool {
    match (to, from) {
        (Some(to), Some(from)) => match (parse_jid(to), parse_jid(from)) {
            (Ok(to), Ok(from)) => to == from,
            _ => to == from,
        },
        (Some(_), None) => false,
        (None, None) => true,
        (None, Some(from)) => match (parse_jid(from), own) {
            (Ok(from), Some(own)) => {
                from == *own || from == own.to_bare() || from == BareJid::from(own.domain())
            }
            _ => false,
        },
    }
}

async fn write_loop(
    connection: WeakConnection,
    transport: Arc<dyn XmppTransport>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    epoch: u64,
) {
    while let Some(Outbound { payload, done }) = queue.recv().await {
        trace!(bytes = payload.len(), "writing stanza");
        let result = transport.send(&payload).await;
        let failure = result.as_ref().err().cloned();
        if let Some(done) = done {
            let _ = done.send(result);
        }
        if let Some(error) = failure {
            if let Some(connection) = connection.upgrade() {
                connection.spawn_failure_handling(epoch, error);
            }
            return;
        }
    }
}

async fn read_loop(connection: WeakConnection, transport: Arc<dyn XmppTransport>, epoch: u64) {
    loop {
        let frame = transport.recv().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match frame {
            Ok(frame) => connection.handle_frame(&frame),
            Err(error) => {
                connection.spawn_failure_handling(epoch, error);
                return;
            }
        }
    }
}

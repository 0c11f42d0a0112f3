//! # Router
//!
//! The long-lived owner of everything shared between connections: the
//! connection manager, the command dispatcher, the subscription registry, the
//! event-threshold controller and the host-command cache. There are no ambient
//! globals; a process may run several routers side by side.
//!
//! Transports talk to a router through three entry points:
//! [`Router::handle_connect`], [`Router::handle_message`] and
//! [`Router::handle_disconnect`]. Backends push changes in through
//! [`Router::ingest`] (or the individual `*_change` methods).
//!
//! Every change to the subscription registry and every upstream
//! subscribe/unsubscribe runs under one async gate, so the backend always sees
//! the transitions in the order the registry produced them, and an event-storm
//! trip or restore never interleaves with them.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendCommand, BackendEvent, RemoteCatalog, SessionStore};
use crate::commands;
use crate::configs::GatewaySettings;
use crate::core::acl::{self, AccessFlag, Operation, ResourceKind};
use crate::core::connection::{ConnectRequest, Connection, ConnectionId, ConnectionPhase, Outbound};
use crate::core::dispatcher::{CommandContext, CommandDispatcher, CommandHandler, CommandReply, CommandTable};
use crate::core::host_cache::HostCommandCache;
use crate::core::lifecycle::{ConnectionManager, Freshness};
use crate::core::permissions::PermissionTable;
use crate::core::registry::{EventKind, Subscriber, SubscriptionKey, SubscriptionRegistry, UpstreamChange};
use crate::core::threshold::{
    EventThreshold, ThresholdAction, ThresholdSnapshot, COARSE_PATTERN, THRESHOLD_TICK, TRIP_DEBOUNCE,
};
use crate::error::{GatewayError, COMMAND_RE_AUTHENTICATE};

/// Called with `true` when the breaker trips and `false` when it restores.
pub type ThresholdListener = Arc<dyn Fn(&Router, bool) + Send + Sync>;
/// Called once per disconnect with the connection id and the reason.
pub type DisconnectHook = Arc<dyn Fn(ConnectionId, &str) + Send + Sync>;

/// Outbound event names.
pub const EVENT_THRESHOLD: &str = "eventsThreshold";
pub const EVENT_REPO_UPDATED: &str = "repoUpdated";
pub const EVENT_INSTANCE_MESSAGE: &str = "im";

/// Key used for log streaming subscriptions.
pub fn log_key() -> SubscriptionKey {
    SubscriptionKey::new(EventKind::Log, "*")
}

#[derive(Debug, Default)]
struct UpstreamGate {
    /// State patterns have been swapped for the coarse one.
    suspended: bool,
}

pub struct RouterBuilder {
    settings: GatewaySettings,
    backend: Arc<dyn Backend>,
    store: Arc<dyn SessionStore>,
    catalog: Option<Arc<dyn RemoteCatalog>>,
    commands: CommandTable,
    permissions: PermissionTable,
    threshold_listeners: Vec<ThresholdListener>,
}

impl RouterBuilder {
    pub fn catalog(mut self, catalog: Arc<dyn RemoteCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Adds the administrative command set and tells every client about
    /// threshold trips.
    pub fn admin(mut self) -> Self {
        self.commands.extend(commands::admin_commands());
        self.threshold_listeners.push(Arc::new(|router: &Router, active: bool| {
            router.broadcast(EVENT_THRESHOLD, vec![json!(active)]);
        }));
        self
    }

    /// Adds or overrides commands.
    pub fn commands(mut self, table: CommandTable) -> Self {
        self.commands.extend(table);
        self
    }

    pub fn permissions(mut self, permissions: PermissionTable) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn on_threshold(mut self, listener: ThresholdListener) -> Self {
        self.threshold_listeners.push(listener);
        self
    }

    pub fn build(self) -> Arc<Router> {
        let shutdown = CancellationToken::new();
        Arc::new(Router {
            connections: ConnectionManager::new(&self.settings, Arc::clone(&self.backend), Arc::clone(&self.store)),
            dispatcher: CommandDispatcher::new(self.commands, self.permissions),
            registry: Mutex::new(SubscriptionRegistry::new()),
            upstream: AsyncMutex::new(UpstreamGate::default()),
            threshold: Mutex::new(EventThreshold::new(&self.settings.events_threshold)),
            threshold_listeners: RwLock::new(self.threshold_listeners),
            disconnect_hooks: RwLock::new(Vec::new()),
            host_cache: HostCommandCache::new(shutdown.child_token()),
            ratings: Mutex::new(None),
            settings: self.settings,
            backend: self.backend,
            store: self.store,
            catalog: self.catalog,
            shutdown,
        })
    }
}

pub struct Router {
    settings: GatewaySettings,
    backend: Arc<dyn Backend>,
    store: Arc<dyn SessionStore>,
    catalog: Option<Arc<dyn RemoteCatalog>>,
    connections: ConnectionManager,
    dispatcher: CommandDispatcher,
    registry: Mutex<SubscriptionRegistry>,
    upstream: AsyncMutex<UpstreamGate>,
    threshold: Mutex<EventThreshold>,
    threshold_listeners: RwLock<Vec<ThresholdListener>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
    host_cache: HostCommandCache,
    ratings: Mutex<Option<Value>>,
    shutdown: CancellationToken,
}

impl Router {
    /// A router with the base command set and the standard permission table.
    pub fn builder(
        settings: GatewaySettings,
        backend: Arc<dyn Backend>,
        store: Arc<dyn SessionStore>,
    ) -> RouterBuilder {
        RouterBuilder {
            settings,
            backend,
            store,
            catalog: None,
            commands: commands::base_commands(),
            permissions: PermissionTable::standard(),
            threshold_listeners: Vec::new(),
        }
    }

    // --- Lifecycle ---

    /// Starts the threshold tick. The task only holds a weak reference.
    pub fn start(self: &Arc<Self>) {
        if !self.threshold.lock().is_enabled() {
            debug!("Event threshold disabled");
            return;
        }
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + THRESHOLD_TICK, THRESHOLD_TICK);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(router) = weak.upgrade() else { break };
                        let action = router.threshold.lock().tick(Instant::now());
                        router.apply_threshold(action).await;
                    }
                }
            }
            debug!("Threshold tick stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // --- Transport entry points ---

    /// Accepts and authenticates a connection. On failure the client is told to
    /// re-authenticate and, unless the transport cannot close, disconnected.
    pub async fn handle_connect(&self, request: ConnectRequest, outbound: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let conn = self.connections.accept(&request, outbound);
        let id = conn.id();
        match self.connections.authenticate(&conn, &request.credential).await {
            Ok(()) => self.connections.activate(&conn),
            Err(err) => {
                warn!(
                    conn = id,
                    addr = conn.remote_addr().unwrap_or("-"),
                    error = %err,
                    "Connection rejected"
                );
                conn.emit(COMMAND_RE_AUTHENTICATE, Vec::new());
                if !self.settings.no_disconnect {
                    conn.close();
                    self.handle_disconnect(id, "unauthenticated").await;
                }
            }
        }
        id
    }

    pub async fn handle_message(self: &Arc<Self>, id: ConnectionId, command: &str, args: Vec<Value>) -> CommandReply {
        let Some(conn) = self.connections.get(id) else {
            return CommandReply::from_error(&GatewayError::Unauthenticated);
        };
        if conn.phase() != ConnectionPhase::Active {
            return CommandReply::from_error(&GatewayError::Unauthenticated);
        }
        if self.connections.refresh(&conn) == Freshness::Expired {
            debug!(conn = id, command, "Session expired");
            conn.emit(COMMAND_RE_AUTHENTICATE, Vec::new());
            return CommandReply::from_error(&GatewayError::Unauthenticated);
        }

        let ctx = CommandContext {
            router: Arc::clone(self),
            connection: conn,
        };
        self.dispatcher.dispatch(ctx, command, args).await
    }

    /// Tears a connection down. Safe to call more than once.
    pub async fn handle_disconnect(&self, id: ConnectionId, reason: &str) {
        if self.connections.remove(id).is_none() {
            return;
        }
        {
            let gate = self.upstream.lock().await;
            let changes = self.registry.lock().unsubscribe_all(Subscriber::Connection(id));
            for change in changes {
                self.forward(&gate, change).await;
            }
        }
        let hooks = self.disconnect_hooks.read().clone();
        for hook in hooks {
            hook(id, reason);
        }
        info!(conn = id, reason, "Connection closed");
    }

    pub fn on_disconnect(&self, hook: DisconnectHook) {
        self.disconnect_hooks.write().push(hook);
    }

    pub fn add_command_handler(&self, name: &str, handler: CommandHandler) {
        self.dispatcher.register(name, handler);
    }

    // --- Subscriptions ---

    /// `None` subscribes on behalf of the process itself. A connection that
    /// has already been torn down is refused, so nothing is left behind for a
    /// cleanup that already ran.
    pub async fn subscribe(&self, subscriber: Option<ConnectionId>, key: SubscriptionKey) -> Result<(), GatewayError> {
        let gate = self.upstream.lock().await;
        // disconnect removes the connection before it takes the gate
        if let Some(id) = subscriber {
            if self.connections.get(id).is_none() {
                debug!(conn = id, pattern = %key.pattern, "Subscription from a closed connection dropped");
                return Err(GatewayError::Unauthenticated);
            }
        }
        let subscriber = subscriber.map_or(Subscriber::Process, Subscriber::Connection);
        let change = self
            .registry
            .lock()
            .subscribe(subscriber, key)
            .map_err(|e| GatewayError::invalid(e.to_string()))?;
        if let Some(change) = change {
            self.forward(&gate, change).await;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, subscriber: Option<ConnectionId>, key: &SubscriptionKey) {
        let subscriber = subscriber.map_or(Subscriber::Process, Subscriber::Connection);
        let gate = self.upstream.lock().await;
        let change = self.registry.lock().unsubscribe(subscriber, key);
        if let Some(change) = change {
            self.forward(&gate, change).await;
        }
    }

    async fn forward(&self, gate: &UpstreamGate, change: UpstreamChange) {
        let (key, start) = match &change {
            UpstreamChange::Start(key) => (key, true),
            UpstreamChange::Stop(key) => (key, false),
        };
        if gate.suspended && key.kind == EventKind::StateChange {
            debug!(pattern = %key.pattern, start, "State subscriptions suspended, kept local");
            return;
        }
        debug!(kind = ?key.kind, pattern = %key.pattern, start, "Upstream subscription change");
        let file_pattern = key.file_pattern.as_deref();
        let result = if start {
            self.backend.subscribe(key.kind, &key.pattern, file_pattern).await
        } else {
            self.backend.unsubscribe(key.kind, &key.pattern, file_pattern).await
        };
        if let Err(e) = result {
            warn!(kind = ?key.kind, pattern = %key.pattern, error = %e, "Upstream subscription change failed");
        }
    }

    pub fn subscribe_instance(&self, conn: ConnectionId, instance: &str, message_type: &str) -> Result<(), GatewayError> {
        let mut registry = self.registry.lock();
        if self.connections.get(conn).is_none() {
            return Err(GatewayError::Unauthenticated);
        }
        registry.subscribe_instance(conn, instance, message_type);
        Ok(())
    }

    pub fn unsubscribe_instance(&self, conn: ConnectionId, instance: &str, message_type: Option<&str>) {
        self.registry.lock().unsubscribe_instance(conn, instance, message_type);
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.registry.lock().ref_count(key)
    }

    pub fn holds(&self, conn: ConnectionId, key: &SubscriptionKey) -> bool {
        self.registry.lock().holds(Subscriber::Connection(conn), key)
    }

    // --- Publish ---

    /// Emits `kind(id, payload)` to every interested connection allowed to
    /// read it. Returns whether anyone received it.
    pub fn publish(&self, kind: EventKind, id: &str, payload: Option<Value>) -> bool {
        let targets = self.registry.lock().interested(kind, id, None);
        let args = vec![json!(id), payload.unwrap_or(Value::Null)];
        self.deliver(kind, &targets, None, args)
    }

    pub fn publish_file(&self, id: &str, file_name: &str, size: Option<u64>) -> bool {
        let targets = self
            .registry
            .lock()
            .interested(EventKind::FileChange, id, Some(file_name));
        let args = vec![json!(id), json!(file_name), size.map_or(Value::Null, |s| json!(s))];
        self.deliver(EventKind::FileChange, &targets, None, args)
    }

    /// Emits `im(messageType, source, data)` to the connections that asked for it.
    pub fn publish_instance_message(&self, source: &str, message_type: &str, data: Value) -> bool {
        let targets = self.registry.lock().instance_listeners(source, message_type);
        let mut delivered = false;
        for conn in targets.into_iter().filter_map(|id| self.connections.get(id)) {
            if conn.phase() != ConnectionPhase::Active {
                continue;
            }
            delivered |= conn.emit(
                EVENT_INSTANCE_MESSAGE,
                vec![json!(message_type), json!(source), data.clone()],
            );
        }
        delivered
    }

    fn deliver(&self, kind: EventKind, targets: &[ConnectionId], object: Option<&Value>, args: Vec<Value>) -> bool {
        let mut delivered = false;
        for conn in targets.iter().filter_map(|id| self.connections.get(*id)) {
            if !self.may_receive(&conn, kind, object) {
                continue;
            }
            delivered |= conn.emit(kind.event_name(), args.clone());
        }
        delivered
    }

    fn may_receive(&self, conn: &Connection, kind: EventKind, object: Option<&Value>) -> bool {
        if conn.phase() != ConnectionPhase::Active || !self.connections.is_fresh(conn) {
            return false;
        }
        let acl = conn.acl();
        if let Some(resource) = kind.resource() {
            if !acl.allows(resource, Operation::Read) {
                return false;
            }
        }
        match object {
            Some(obj) => acl::check_object(obj, &acl, ResourceKind::Object, AccessFlag::Read),
            None => true,
        }
    }

    /// Emits to every active connection. Returns how many were reached.
    pub fn broadcast(&self, event: &str, args: Vec<Value>) -> usize {
        self.connections
            .active()
            .iter()
            .filter(|conn| conn.emit(event, args.clone()))
            .count()
    }

    // --- Ingestion ---

    pub fn state_change(&self, id: &str, state: Option<Value>) -> bool {
        self.threshold.lock().record_event();
        self.publish(EventKind::StateChange, id, state)
    }

    pub fn object_change(&self, id: &str, obj: Option<Value>) -> bool {
        let targets = self.registry.lock().interested(EventKind::ObjectChange, id, None);
        let guarded = obj.as_ref().filter(|o| o.get("acl").is_some()).cloned();
        let args = vec![json!(id), obj.unwrap_or(Value::Null)];
        self.deliver(EventKind::ObjectChange, &targets, guarded.as_ref(), args)
    }

    pub fn file_change(&self, id: &str, file_name: &str, size: Option<u64>) -> bool {
        self.publish_file(id, file_name, size)
    }

    pub fn log_message(&self, entry: Value) -> bool {
        let targets = self.registry.lock().interested(EventKind::Log, "", None);
        self.deliver(EventKind::Log, &targets, None, vec![entry])
    }

    pub fn repo_updated(&self) {
        self.host_cache.invalidate("getRepository");
        self.broadcast(EVENT_REPO_UPDATED, Vec::new());
    }

    pub fn send_command(&self, command: BackendCommand) {
        match command {
            BackendCommand::UpdateTokenExpiration { token, expires_at_ms } => {
                let updated = self.connections.update_token_expiration(&token, expires_at_ms);
                debug!(updated, "Token expiration updated");
            }
            BackendCommand::Logout { token } => {
                for conn in self.connections.with_token(&token) {
                    conn.emit(COMMAND_RE_AUTHENTICATE, Vec::new());
                }
            }
        }
    }

    pub fn ingest(&self, event: BackendEvent) -> bool {
        match event {
            BackendEvent::StateChange { id, state } => self.state_change(&id, state),
            BackendEvent::ObjectChange { id, obj } => self.object_change(&id, obj),
            BackendEvent::FileChange { id, file_name, size } => self.file_change(&id, &file_name, size),
            BackendEvent::Log(entry) => self.log_message(entry),
        }
    }

    // --- Event threshold ---

    pub async fn enable_threshold(&self) {
        let action = self.threshold.lock().force_enable(Instant::now());
        self.apply_threshold(action).await;
    }

    pub async fn disable_threshold(&self) {
        let action = self.threshold.lock().force_disable();
        self.apply_threshold(action).await;
    }

    pub fn threshold_active(&self) -> bool {
        self.threshold.lock().is_active()
    }

    pub fn threshold_snapshot(&self) -> ThresholdSnapshot {
        self.threshold.lock().snapshot()
    }

    async fn apply_threshold(&self, action: ThresholdAction) {
        match action {
            ThresholdAction::None => {}
            ThresholdAction::Trip => {
                tokio::time::sleep(TRIP_DEBOUNCE).await;
                if !self.threshold.lock().is_active() {
                    return;
                }
                {
                    let mut gate = self.upstream.lock().await;
                    if gate.suspended {
                        return;
                    }
                    let patterns = self.registry.lock().patterns(EventKind::StateChange);
                    for key in &patterns {
                        if let Err(e) = self.backend.unsubscribe(EventKind::StateChange, &key.pattern, None).await {
                            warn!(pattern = %key.pattern, error = %e, "Failed to drop state subscription");
                        }
                    }
                    if let Err(e) = self.backend.subscribe(EventKind::StateChange, COARSE_PATTERN, None).await {
                        warn!(error = %e, "Failed to subscribe coarse state pattern");
                    }
                    gate.suspended = true;
                    info!(patterns = patterns.len(), "Event threshold tripped, state subscriptions suspended");
                }
                self.notify_threshold(true);
            }
            ThresholdAction::Restore => {
                {
                    let mut gate = self.upstream.lock().await;
                    if gate.suspended {
                        if let Err(e) = self.backend.unsubscribe(EventKind::StateChange, COARSE_PATTERN, None).await {
                            warn!(error = %e, "Failed to drop coarse state pattern");
                        }
                        let patterns = self.registry.lock().patterns(EventKind::StateChange);
                        for key in &patterns {
                            if let Err(e) = self.backend.subscribe(EventKind::StateChange, &key.pattern, None).await {
                                warn!(pattern = %key.pattern, error = %e, "Failed to restore state subscription");
                            }
                        }
                        gate.suspended = false;
                        info!(patterns = patterns.len(), "Event threshold restored");
                    }
                }
                self.notify_threshold(false);
            }
        }
    }

    fn notify_threshold(&self, active: bool) {
        let listeners = self.threshold_listeners.read().clone();
        for listener in listeners {
            listener(self, active);
        }
    }

    // --- Accessors ---

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn catalog(&self) -> Option<&Arc<dyn RemoteCatalog>> {
        self.catalog.as_ref()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn host_cache(&self) -> &HostCommandCache {
        &self.host_cache
    }

    pub fn permissions(&self) -> &PermissionTable {
        self.dispatcher.permissions()
    }

    pub fn commands(&self) -> Vec<String> {
        self.dispatcher.commands()
    }

    pub fn cached_ratings(&self) -> Option<Value> {
        self.ratings.lock().clone()
    }

    pub fn store_ratings(&self, ratings: Value) {
        *self.ratings.lock() = Some(ratings);
    }
}

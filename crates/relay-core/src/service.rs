//! The socket service: one value that owns every connection-layer component
//! for a process and drives their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bridge::{RouteBridge, RouteCall, RouteResolver, RouteTable, DEFAULT_CHAIN_TIMEOUT};
use crate::bus::{BroadcastBus, BusEvent, BusPayload, Emitter, MessageBus};
use crate::collaborators::{
    Authorizer, ErrorReporter, GroupAuthorizer, IdentityProvider, PassthroughIdentity,
};
use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionMeta, Principal};
use crate::error::Result;
use crate::presence::{
    InMemoryPresenceStore, InstanceId, InstanceRole, PresenceAggregator, PresenceStore,
};
use crate::protocol::{ClientMessage, ServerFrame};
use crate::registry::ConnectionRegistry;
use crate::routing::{MessageRouter, RoomTransport};
use crate::rpc::{
    CallContextHook, CallOutcome, CallRegistry, RpcDispatcher, DEFAULT_HANDLER_TIMEOUT,
};

/// Room every connection of a user joins on accept.
pub fn user_room(user_id: &str) -> String {
    format!("user.{user_id}")
}

/// Room every connection of a session joins on accept.
pub fn session_room(session_id: &str) -> String {
    format!("session.{session_id}")
}

/// Service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deployment identifier; scopes the presence namespace.
    pub deployment: String,
    pub instance_id: InstanceId,
    pub handler_timeout: Duration,
    pub chain_timeout: Duration,
    /// Join `user.<id>` and `session.<id>` rooms on accept.
    pub auto_join_rooms: bool,
}

impl ServiceConfig {
    pub fn new(deployment: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            deployment: deployment.into(),
            instance_id,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            chain_timeout: DEFAULT_CHAIN_TIMEOUT,
            auto_join_rooms: true,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_chain_timeout(mut self, timeout: Duration) -> Self {
        self.chain_timeout = timeout;
        self
    }

    pub fn with_auto_join_rooms(mut self, enabled: bool) -> Self {
        self.auto_join_rooms = enabled;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(
            "relay",
            InstanceId::new(InstanceRole::Front, uuid::Uuid::new_v4().to_string()),
        )
    }
}

/// Collects collaborators for a [`SocketService`]. Anything not supplied
/// falls back to an in-process default.
pub struct SocketServiceBuilder {
    config: ServiceConfig,
    bus: Option<Arc<dyn MessageBus>>,
    presence_store: Option<Arc<dyn PresenceStore>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
    hooks: Vec<Arc<dyn CallContextHook>>,
    resolver: Option<Arc<dyn RouteResolver>>,
    calls: Option<Arc<CallRegistry>>,
}

impl SocketServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            bus: None,
            presence_store: None,
            identity: None,
            authorizer: None,
            error_reporter: None,
            hooks: Vec::new(),
            resolver: None,
            calls: None,
        }
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn presence_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.presence_store = Some(store);
        self
    }

    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    pub fn context_hook(mut self, hook: Arc<dyn CallContextHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn route_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn calls(mut self, calls: Arc<CallRegistry>) -> Self {
        self.calls = Some(calls);
        self
    }

    /// Assemble the service around the transport's room implementation.
    pub fn build(self, rooms: Arc<dyn RoomTransport>) -> SocketService {
        let config = self.config;
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(BroadcastBus::default()));
        let store = self
            .presence_store
            .unwrap_or_else(|| Arc::new(InMemoryPresenceStore::new()));
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(PassthroughIdentity));
        let authorizer = self.authorizer.unwrap_or_else(|| Arc::new(GroupAuthorizer));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(RouteTable::new()));
        let calls = self.calls.unwrap_or_default();

        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            rooms,
            bus.clone(),
        ));

        let mut dispatcher =
            RpcDispatcher::new(calls.clone(), identity.clone(), authorizer)
                .with_handler_timeout(config.handler_timeout);
        for hook in self.hooks {
            dispatcher = dispatcher.with_hook(hook);
        }
        if let Some(reporter) = self.error_reporter {
            dispatcher = dispatcher.with_error_reporter(reporter);
        }

        let bridge = RouteBridge::new(resolver, identity).with_chain_timeout(config.chain_timeout);
        let presence = PresenceAggregator::new(
            store,
            bus.clone(),
            &config.deployment,
            config.instance_id.clone(),
        );

        info!(
            deployment = %config.deployment,
            instance = %config.instance_id,
            "Socket service assembled"
        );

        SocketService {
            config,
            bus,
            registry,
            router,
            calls,
            dispatcher,
            bridge,
            presence,
            router_task: Mutex::new(None),
        }
    }
}

/// The running bus consumer and the token that stops it.
struct RouterTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Composition root for the connection layer.
pub struct SocketService {
    config: ServiceConfig,
    bus: Arc<dyn MessageBus>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    calls: Arc<CallRegistry>,
    dispatcher: RpcDispatcher,
    bridge: RouteBridge,
    presence: PresenceAggregator,
    router_task: Mutex<Option<RouterTask>>,
}

impl SocketService {
    pub fn builder(config: ServiceConfig) -> SocketServiceBuilder {
        SocketServiceBuilder::new(config)
    }

    /// Begin consuming bus events. Calling it while running is a no-op;
    /// calling it after `stop` starts a fresh consumer.
    pub fn start(&self) -> Result<()> {
        let mut task = self.router_task.lock();
        if task.is_some() {
            return Ok(());
        }
        let shutdown = CancellationToken::new();
        let handle = self.router.spawn(shutdown.clone())?;
        *task = Some(RouterTask { shutdown, handle });
        info!(instance = %self.config.instance_id, "Socket service started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.router_task.lock().is_some()
    }

    /// Stop the router, close remaining connections and withdraw this
    /// instance from presence totals.
    pub async fn stop(&self) {
        let task = self.router_task.lock().take();
        if let Some(task) = task {
            task.shutdown.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Router task ended abnormally");
            }
        }

        for connection in self.registry.connections() {
            connection.handle.close();
            if let Some(closed) = self.registry.unregister(&connection.id) {
                self.publish(BusPayload::ConnectionClosed(closed.summary()));
            }
        }

        if let Err(e) = self.presence.withdraw().await {
            warn!(error = %e, "Failed to withdraw presence");
        }
        info!(instance = %self.config.instance_id, "Socket service stopped");
    }

    /// Register a newly opened transport connection.
    #[instrument(
        skip(self, handle, principal, meta),
        fields(user_id = ?principal.as_ref().map(|p| &p.id))
    )]
    pub async fn accept(
        &self,
        handle: Arc<dyn ConnectionHandle>,
        principal: Option<Principal>,
        session_id: String,
        meta: ConnectionMeta,
    ) -> Result<Connection> {
        let connection = Connection::new(ConnectionId::generate(), principal, session_id, handle)
            .with_meta(meta);
        self.registry.register(connection.clone())?;

        if self.config.auto_join_rooms {
            if let Some(user_id) = connection.user_id() {
                connection.handle.join(&user_room(user_id));
            }
            connection.handle.join(&session_room(&connection.session_id));
        }

        if let Err(e) = connection.handle.send(ServerFrame::Connected {
            connection_id: connection.id.clone(),
        }) {
            debug!(error = %e, "Could not send connected frame");
        }

        self.publish(BusPayload::ConnectionOpened(connection.summary()));
        self.publish_presence().await;
        info!(connection_id = %connection.id, "Connection accepted");

        Ok(connection)
    }

    /// Forget a connection. Idempotent.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub async fn disconnect(&self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.registry.unregister(id)?;
        self.publish(BusPayload::ConnectionClosed(connection.summary()));
        self.publish_presence().await;
        info!("Connection closed");
        Some(connection)
    }

    /// Handle one decoded client message on `connection`.
    pub async fn handle_message(&self, connection: &Connection, message: ClientMessage) {
        match message {
            ClientMessage::Call { id, name, args } => {
                self.dispatch_call(connection, id, &name, args).await;
            }
            ClientMessage::Route {
                id,
                method,
                path,
                query,
                body,
            } => {
                self.bridge
                    .handle(
                        connection,
                        RouteCall {
                            id,
                            method,
                            path,
                            query,
                            body,
                        },
                    )
                    .await;
            }
            ClientMessage::Ping => {
                if let Err(e) = connection.handle.send(ServerFrame::Pong) {
                    debug!(error = %e, "Pong dropped");
                }
            }
        }
    }

    pub async fn dispatch_call(
        &self,
        connection: &Connection,
        id: serde_json::Value,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Vec<CallOutcome> {
        self.dispatcher.dispatch(connection, id, name, args).await
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn calls(&self) -> &Arc<CallRegistry> {
        &self.calls
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn presence(&self) -> &PresenceAggregator {
        &self.presence
    }

    pub fn emitter(&self) -> Emitter {
        Emitter::new(self.bus.clone())
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn publish_presence(&self) {
        if let Err(e) = self.presence.publish(self.registry.count() as u64).await {
            warn!(error = %e, "Failed to publish presence");
        }
    }

    fn publish(&self, payload: BusPayload) {
        if let Err(e) = self.bus.publish(BusEvent::new(payload)) {
            warn!(error = %e, "Failed to publish lifecycle event");
        }
    }
}

impl std::fmt::Debug for SocketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketService")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}

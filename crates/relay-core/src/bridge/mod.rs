//! Route calls over sockets.
//!
//! A client can invoke an HTTP-style handler chain through its socket. The
//! bridge synthesizes a request from what the connection already knows
//! (cached headers, principal, session), walks the resolved chain and sends
//! the captured status and body back under the client's correlation id.

mod chain;
mod request;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, instrument, warn};

pub use chain::{
    route_fn, Flow, HandlerChain, ResolvedRoute, RouteHandler, RouteResolver, RouteTable,
};
pub use request::{RouteCall, RouteReply, RouteRequest};

use crate::collaborators::IdentityProvider;
use crate::connection::{Connection, Principal};
use crate::error::RelayError;
use crate::metrics;
use crate::protocol::ServerFrame;

pub const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridges socket route calls into handler chains.
pub struct RouteBridge {
    resolver: Arc<dyn RouteResolver>,
    identity: Arc<dyn IdentityProvider>,
    chain_timeout: Duration,
}

impl RouteBridge {
    pub fn new(resolver: Arc<dyn RouteResolver>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            resolver,
            identity,
            chain_timeout: DEFAULT_CHAIN_TIMEOUT,
        }
    }

    pub fn with_chain_timeout(mut self, timeout: Duration) -> Self {
        self.chain_timeout = timeout;
        self
    }

    /// Run a route call and send its reply. Returns the reply that was
    /// sent, or `None` when the caller's identity could not be refreshed, in
    /// which case nothing is sent.
    #[instrument(
        skip(self, connection, call),
        fields(connection_id = %connection.id, method = %call.method, path = %call.path)
    )]
    pub async fn handle(&self, connection: &Connection, call: RouteCall) -> Option<RouteReply> {
        let principal = match self.refresh_identity(connection).await {
            Ok(principal) => principal,
            Err(e) => {
                debug!(
                    user_id = ?connection.user_id(),
                    error = %e,
                    "Identity refresh failed, dropping route call"
                );
                return None;
            }
        };
        let mut request = RouteRequest::synthesize(connection, principal, &call);
        let method = request.method.clone();

        let reply = match self.resolver.resolve(&request.method, &request.path) {
            Some(resolved) => {
                request.params = resolved.params;
                match self.run(&resolved.chain, request).await {
                    Ok(reply) => reply,
                    Err(RelayError::NotFound(msg)) => {
                        debug!(reason = %msg, "Chain ended without a response");
                        RouteReply::error(404, "Not Found")
                    }
                    Err(RelayError::RouteTimeout(after)) => {
                        warn!(?after, "Route chain timed out");
                        RouteReply::error(504, "Gateway Timeout")
                    }
                    Err(e) => {
                        warn!(error = %e, "Route chain failed");
                        RouteReply::error(500, "Internal Server Error")
                    }
                }
            }
            None => {
                debug!("No route resolved");
                RouteReply::error(404, "Not Found")
            }
        };

        metrics::record_route_status(&method, reply.status);
        if let Err(e) = connection
            .handle
            .send(ServerFrame::reply(call.id, reply.to_payload()))
        {
            debug!(error = %e, "Route reply dropped");
        }
        Some(reply)
    }

    async fn refresh_identity(
        &self,
        connection: &Connection,
    ) -> Result<Option<Principal>, RelayError> {
        match connection.principal.as_ref() {
            Some(principal) => self.identity.refresh(principal).await.map(Some),
            None => Ok(None),
        }
    }

    async fn run(
        &self,
        chain: &HandlerChain,
        mut request: RouteRequest,
    ) -> Result<RouteReply, RelayError> {
        let walk = async move {
            for handler in chain.handlers() {
                match handler.handle(&mut request).await {
                    Ok(Flow::Next) => continue,
                    Ok(Flow::Respond(reply)) => return Ok(reply),
                    Err(e) => return Err(RelayError::handler_fault(format!("{e:#}"))),
                }
            }
            Err(RelayError::not_found("handler chain exhausted"))
        };

        let guarded = AssertUnwindSafe(walk).catch_unwind();
        match tokio::time::timeout(self.chain_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(RelayError::handler_fault("route handler panicked")),
            Err(_elapsed) => Err(RelayError::RouteTimeout(self.chain_timeout)),
        }
    }
}

impl std::fmt::Debug for RouteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBridge")
            .field("chain_timeout", &self.chain_timeout)
            .finish()
    }
}

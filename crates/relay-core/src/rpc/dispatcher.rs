//! Call dispatch.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use super::context::{CallContext, CallContextHook};
use super::table::{CallRegistration, CallRegistry, CallTable};
use crate::collaborators::{Authorizer, CallFault, ErrorReporter, IdentityProvider};
use crate::connection::{Connection, Principal};
use crate::error::RelayError;
use crate::metrics;
use crate::protocol::ServerFrame;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

const SLOW_CALL: Duration = Duration::from_secs(5);

/// Terminal state of one registration's handling of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// No registration matched the path. Nothing is sent.
    Unmatched,
    /// Identity refresh or authorization refused the call. Nothing is sent.
    Denied,
    /// The handler succeeded and a reply was queued.
    Responded,
    /// The handler errored, panicked or timed out.
    Failed,
}

impl CallOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Unmatched => "unmatched",
            CallOutcome::Denied => "denied",
            CallOutcome::Responded => "responded",
            CallOutcome::Failed => "failed",
        }
    }
}

/// Runs client calls against the current call table.
pub struct RpcDispatcher {
    calls: Arc<CallRegistry>,
    identity: Arc<dyn IdentityProvider>,
    authorizer: Arc<dyn Authorizer>,
    hooks: Vec<Arc<dyn CallContextHook>>,
    error_reporter: Option<Arc<dyn ErrorReporter>>,
    handler_timeout: Duration,
}

impl RpcDispatcher {
    pub fn new(
        calls: Arc<CallRegistry>,
        identity: Arc<dyn IdentityProvider>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            calls,
            identity,
            authorizer,
            hooks: Vec::new(),
            error_reporter: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CallContextHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = Some(reporter);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn calls(&self) -> &Arc<CallRegistry> {
        &self.calls
    }

    /// Handle one client call.
    ///
    /// Returns one outcome per matched registration, or a single
    /// `Unmatched`/`Denied` when the call never reached a handler.
    #[instrument(skip(self, connection, id, args), fields(connection_id = %connection.id))]
    pub async fn dispatch(
        &self,
        connection: &Connection,
        id: Value,
        name: &str,
        args: Vec<Value>,
    ) -> Vec<CallOutcome> {
        let principal = match self.refresh_identity(connection).await {
            Ok(principal) => principal,
            Err(e) => {
                debug!(
                    user_id = ?connection.user_id(),
                    error = %e,
                    "Identity refresh failed"
                );
                metrics::record_rpc_outcome(metrics::DENIED_CALL, CallOutcome::Denied.as_str());
                return vec![CallOutcome::Denied];
            }
        };

        let table = self.calls.snapshot();
        let matches = table.lookup(name);
        if matches.is_empty() {
            debug!(epoch = table.epoch(), "No call registered");
            metrics::record_rpc_outcome(
                metric_path(&table, name),
                CallOutcome::Unmatched.as_str(),
            );
            return vec![CallOutcome::Unmatched];
        }
        trace!(matches = matches.len(), epoch = table.epoch(), "Call matched");

        let runs = matches
            .iter()
            .map(|registration| self.run(registration, connection, &principal, &id, &args));
        let outcomes = join_all(runs).await;

        for (registration, outcome) in matches.iter().zip(&outcomes) {
            metrics::record_rpc_outcome(&registration.path, outcome.as_str());
        }
        outcomes
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
        registration: &CallRegistration,
        connection: &Connection,
        principal: &Option<Principal>,
        id: &Value,
        args: &[Value],
    ) -> CallOutcome {
        if let Some(requirement) = &registration.requirement {
            match self.authorizer.authorize(principal.as_ref(), requirement).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(path = %registration.path, "Call denied");
                    return CallOutcome::Denied;
                }
                Err(e) => {
                    warn!(path = %registration.path, error = %e, "Authorizer failed");
                    return CallOutcome::Denied;
                }
            }
        }

        let mut ctx = CallContext::new(connection.clone(), principal.clone(), &registration.path);
        for hook in &self.hooks {
            if let Err(e) = hook.extend(&mut ctx).await {
                return self.fail(&ctx, id, format!("context hook failed: {e}")).await;
            }
        }

        let started = Instant::now();
        let invocation =
            AssertUnwindSafe(registration.handler.call(args.to_vec(), &ctx)).catch_unwind();
        let result = tokio::time::timeout(self.handler_timeout, invocation).await;

        let elapsed = started.elapsed();
        metrics::record_rpc_latency(&registration.path, elapsed.as_secs_f64() * 1000.0);
        if elapsed >= SLOW_CALL {
            warn!(path = %registration.path, duration_secs = elapsed.as_secs_f64(), "Slow call");
        }

        match result {
            Ok(Ok(Ok(value))) => {
                reply(connection, id, value);
                CallOutcome::Responded
            }
            Ok(Ok(Err(e))) => self.fail(&ctx, id, format!("{e:#}")).await,
            Ok(Err(_panic)) => self.fail(&ctx, id, "handler panicked".to_string()).await,
            Err(_elapsed) => {
                self.fail(&ctx, id, format!("handler timed out after {:?}", self.handler_timeout))
                    .await
            }
        }
    }

    async fn fail(&self, ctx: &CallContext, id: &Value, message: String) -> CallOutcome {
        warn!(
            path = %ctx.path,
            connection_id = %ctx.connection.id,
            error = %message,
            "Call failed"
        );

        if let Some(reporter) = &self.error_reporter {
            let fault = CallFault {
                path: ctx.path.clone(),
                connection_id: ctx.connection.id.clone(),
                user_id: ctx.user_id().map(str::to_string),
                message,
            };
            if let Some(payload) = reporter.report(&fault).await {
                reply(&ctx.connection, id, payload);
            }
        }
        CallOutcome::Failed
    }
}

/// Metric label for a call name: the registered path, or a fixed label
/// when nothing is registered under it.
fn metric_path<'t>(table: &'t CallTable, name: &str) -> &'t str {
    table
        .lookup(name)
        .first()
        .map(|registration| registration.path.as_str())
        .unwrap_or(metrics::UNMATCHED_CALL)
}

fn reply(connection: &Connection, id: &Value, payload: Value) {
    if let Err(e) = connection.handle.send(ServerFrame::reply(id.clone(), payload)) {
        debug!(connection_id = %connection.id, error = %e, "Reply dropped");
    }
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("hooks", &self.hooks.len())
            .field("error_reporter", &self.error_reporter.is_some())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handler_fn;
    use serde_json::json;

    #[test]
    fn test_metric_path_never_echoes_unknown_names() {
        let calls = CallRegistry::new();
        calls.update(|b| {
            b.register("math.add", handler_fn(|_args, _ctx| async move { Ok(json!(0)) }));
        });
        let table = calls.snapshot();

        assert_eq!(metric_path(&table, "math.add"), "math.add");
        assert_eq!(metric_path(&table, "random-1234"), metrics::UNMATCHED_CALL);
        assert_eq!(metric_path(&table, ""), metrics::UNMATCHED_CALL);
    }
}

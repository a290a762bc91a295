//! RPC-style calls over sockets.
//!
//! Feature code registers handlers under dotted paths. A client call names a
//! path; every registration under it runs, each gated by its own access
//! requirement, and each success is answered with the client's correlation id.

mod context;
mod dispatcher;
mod table;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use context::{CallContext, CallContextHook};
pub use dispatcher::{CallOutcome, RpcDispatcher, DEFAULT_HANDLER_TIMEOUT};
pub use table::{CallRegistration, CallRegistry, CallTable, CallTableBuilder};

/// A registered call handler.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>, ctx: &CallContext) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`CallHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CallHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>, ctx: &CallContext) -> anyhow::Result<Value> {
        (self.0)(args, ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CallHandler>
where
    F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

//! Handler chains and route resolution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::request::{RouteReply, RouteRequest};

/// What a handler decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Hand the request to the next handler in the chain.
    Next,
    /// Finish the chain with this reply.
    Respond(RouteReply),
}

/// One link of an HTTP-style handler chain.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn handle(&self, req: &mut RouteRequest) -> anyhow::Result<Flow>;
}

struct FnRouteHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnRouteHandler<F>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
{
    async fn handle(&self, req: &mut RouteRequest) -> anyhow::Result<Flow> {
        (self.0)(req.clone()).await
    }
}

/// Wrap an async closure over a request copy as a route handler.
pub fn route_fn<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
{
    Arc::new(FnRouteHandler(f))
}

/// Ordered handlers, run first to last.
#[derive(Clone, Default)]
pub struct HandlerChain(Vec<Arc<dyn RouteHandler>>);

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, handler: Arc<dyn RouteHandler>) -> Self {
        self.0.push(handler);
        self
    }

    pub fn handlers(&self) -> &[Arc<dyn RouteHandler>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.0.len())
            .finish()
    }
}

/// A chain matched to a request, with bound path parameters.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub chain: HandlerChain,
    pub params: HashMap<String, String>,
}

/// Resolves a method and path to the chain that serves it.
pub trait RouteResolver: Send + Sync + 'static {
    fn resolve(&self, method: &str, path: &str) -> Option<ResolvedRoute>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug)]
struct RouteEntry {
    method: Option<String>,
    segments: Vec<Segment>,
    chain: HandlerChain,
}

impl RouteEntry {
    fn matches(&self, method: &str, segments: &[&str]) -> Option<HashMap<String, String>> {
        if let Some(expected) = &self.method {
            if expected != method {
                return None;
            }
        }
        if self.segments.len() != segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(lit) if lit == actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*actual).to_string());
                }
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or("");
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Method plus pattern route table. First registered match wins.
///
/// Patterns use `:name` for a bound segment, e.g. `/rooms/:room/members`.
/// Method `*` matches any method.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, method: &str, pattern: &str, chain: HandlerChain) -> &Self {
        let method = match method {
            "*" => None,
            m => Some(m.to_ascii_uppercase()),
        };
        let segments = split_path(pattern)
            .into_iter()
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();

        self.routes.write().push(RouteEntry {
            method,
            segments,
            chain,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RouteResolver for RouteTable {
    fn resolve(&self, method: &str, path: &str) -> Option<ResolvedRoute> {
        let method = method.to_ascii_uppercase();
        let segments = split_path(path);
        self.routes.read().iter().find_map(|entry| {
            entry.matches(&method, &segments).map(|params| ResolvedRoute {
                chain: entry.chain.clone(),
                params,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok() -> HandlerChain {
        HandlerChain::new().then(route_fn(|_req| async {
            Ok(Flow::Respond(RouteReply::send(json!(null))))
        }))
    }

    #[test]
    fn test_resolve_literal_and_params() {
        let table = RouteTable::new();
        table
            .add("get", "/rooms", ok())
            .add("GET", "/rooms/:room/members/:member", ok());

        assert!(table.resolve("GET", "/rooms").is_some());
        assert!(table.resolve("POST", "/rooms").is_none());

        let resolved = table.resolve("get", "/rooms/lobby/members/42?verbose=1").unwrap();
        assert_eq!(resolved.params.get("room").map(String::as_str), Some("lobby"));
        assert_eq!(resolved.params.get("member").map(String::as_str), Some("42"));
        assert_eq!(resolved.chain.len(), 1);
    }

    #[test]
    fn test_any_method_and_trailing_slash() {
        let table = RouteTable::new();
        table.add("*", "/status/", ok());

        assert!(table.resolve("DELETE", "/status").is_some());
        assert!(table.resolve("GET", "/status/extra").is_none());
    }
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::connection;
use relay_core::bridge::{
    route_fn, Flow, HandlerChain, RouteBridge, RouteCall, RouteHandler, RouteReply, RouteRequest,
    RouteTable,
};
use relay_core::collaborators::PassthroughIdentity;
use relay_core::connection::{CachedHeaders, ConnectionMeta};
use relay_core::Principal;
use serde_json::{json, Map, Value};

fn call(id: Value, method: &str, path: &str) -> RouteCall {
    RouteCall {
        id,
        method: method.into(),
        path: path.into(),
        query: Map::new(),
        body: Value::Null,
    }
}

fn bridge(table: RouteTable) -> RouteBridge {
    RouteBridge::new(Arc::new(table), Arc::new(PassthroughIdentity))
}

/// Marks the request, then continues.
struct Stamp;

#[async_trait]
impl RouteHandler for Stamp {
    async fn handle(&self, req: &mut RouteRequest) -> anyhow::Result<Flow> {
        req.params.insert("stamped".into(), "yes".into());
        Ok(Flow::Next)
    }
}

#[tokio::test]
async fn test_two_handler_chain_replies_with_status_and_body() {
    let table = RouteTable::new();
    table.add(
        "GET",
        "/health",
        HandlerChain::new().then(Arc::new(Stamp)).then(route_fn(|req| async move {
            assert_eq!(req.param("stamped"), Some("yes"));
            Ok(Flow::Respond(RouteReply::send(json!({ "ok": true }))))
        })),
    );
    let (conn, handle) = connection("c1", None, "s1");

    let reply = bridge(table).handle(&conn, call(json!(7), "get", "/health")).await.unwrap();

    assert_eq!(reply.status, 200);
    assert_eq!(
        handle.inbox.replies(),
        vec![(json!(7), json!({ "statusCode": 200, "bodyJSON": "{\"ok\":true}" }))]
    );
}

#[tokio::test]
async fn test_request_carries_connection_context() {
    let table = RouteTable::new();
    table.add(
        "post",
        "/rooms/:room/messages",
        HandlerChain::new().then(route_fn(|req| async move {
            Ok(Flow::Respond(RouteReply::with_status(
                201,
                json!({
                    "room": req.param("room"),
                    "user": req.user_id(),
                    "session": req.session_id,
                    "cookie": req.header("cookie"),
                    "accept": req.header("accept"),
                    "limit": req.query.get("limit"),
                    "body": req.body,
                }),
            )))
        })),
    );
    let (conn, handle) = connection("c1", Some(Principal::new("alice")), "s1");
    let conn = conn.with_meta(ConnectionMeta {
        remote_addr: None,
        headers: CachedHeaders::capture([("Cookie", "sid=s1"), ("Authorization", "secret")]),
    });
    let mut route = call(json!("r"), "POST", "/rooms/lobby/messages");
    route.query.insert("limit".into(), json!(10));
    route.body = json!({ "text": "hi" });

    let reply = bridge(table).handle(&conn, route).await.unwrap();

    assert_eq!(reply.status, 201);
    assert_eq!(
        reply.body,
        json!({
            "room": "lobby",
            "user": "alice",
            "session": "s1",
            "cookie": "sid=s1",
            "accept": "application/json",
            "limit": 10,
            "body": { "text": "hi" },
        })
    );
    assert_eq!(handle.inbox.replies()[0].1["statusCode"], json!(201));
}

#[tokio::test]
async fn test_unresolved_route_is_404() {
    let (conn, handle) = connection("c1", None, "s1");

    let reply = bridge(RouteTable::new())
        .handle(&conn, call(json!(1), "GET", "/missing"))
        .await
        .unwrap();

    assert_eq!(reply.status, 404);
    assert_eq!(handle.inbox.replies().len(), 1);
}

#[tokio::test]
async fn test_exhausted_chain_is_404() {
    let table = RouteTable::new();
    table.add("GET", "/pass", HandlerChain::new().then(Arc::new(Stamp)));
    let (conn, _handle) = connection("c1", None, "s1");

    let reply = bridge(table).handle(&conn, call(json!(1), "GET", "/pass")).await.unwrap();

    assert_eq!(reply.status, 404);
}

#[tokio::test]
async fn test_hanging_chain_times_out() {
    let table = RouteTable::new();
    table.add(
        "GET",
        "/hang",
        HandlerChain::new().then(route_fn(|_req| async {
            std::future::pending::<()>().await;
            Ok(Flow::Next)
        })),
    );
    let (conn, handle) = connection("c1", None, "s1");
    let bridge = bridge(table).with_chain_timeout(Duration::from_millis(50));

    let reply = bridge.handle(&conn, call(json!(1), "GET", "/hang")).await.unwrap();

    assert_eq!(reply.status, 504);
    assert_eq!(handle.inbox.replies()[0].1["statusCode"], json!(504));
}

#[tokio::test]
async fn test_failing_handler_is_500() {
    let table = RouteTable::new();
    table.add(
        "DELETE",
        "/items/:id",
        HandlerChain::new().then(route_fn(|_req| async { Err(anyhow::anyhow!("locked")) })),
    );
    let (conn, _handle) = connection("c1", None, "s1");

    let reply = bridge(table)
        .handle(&conn, call(json!(1), "delete", "/items/3"))
        .await
        .unwrap();

    assert_eq!(reply.status, 500);
    assert_eq!(reply.body, json!({ "error": "Internal Server Error" }));
}

#[tokio::test]
async fn test_revoked_identity_drops_route_silently() {
    let table = RouteTable::new();
    table.add(
        "GET",
        "/me",
        HandlerChain::new().then(route_fn(|req| async move {
            Ok(Flow::Respond(RouteReply::send(json!(req.user_id()))))
        })),
    );
    let (conn, handle) = connection("c1", Some(Principal::new("mallory")), "s1");
    let bridge = RouteBridge::new(Arc::new(table), Arc::new(common::RevokedIdentity));

    let reply = bridge.handle(&conn, call(json!(1), "GET", "/me")).await;

    assert!(reply.is_none());
    assert!(handle.inbox.frames().is_empty());
}

#[tokio::test]
async fn test_anonymous_route_skips_identity_refresh() {
    let table = RouteTable::new();
    table.add(
        "GET",
        "/me",
        HandlerChain::new().then(route_fn(|req| async move {
            Ok(Flow::Respond(RouteReply::send(json!(req.user_id()))))
        })),
    );
    let (conn, _handle) = connection("c1", None, "s1");
    let bridge = RouteBridge::new(Arc::new(table), Arc::new(common::RevokedIdentity));

    let reply = bridge.handle(&conn, call(json!(1), "GET", "/me")).await.unwrap();

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, Value::Null);
}

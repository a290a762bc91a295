//! Calls and routes every relay server exposes.

use relay_core::bridge::{route_fn, Flow, HandlerChain, RouteReply, RouteTable};
use relay_core::rpc::{handler_fn, CallRegistry};
use serde_json::json;

/// Register the built-in socket calls.
///
/// - `relay.ping` answers `"pong"`.
/// - `relay.whoami` describes the calling connection.
pub fn register_calls(calls: &CallRegistry) -> u64 {
    calls.update(|table| {
        table.register("relay.ping", handler_fn(|_args, _ctx| async move { Ok(json!("pong")) }));
        table.register(
            "relay.whoami",
            handler_fn(|_args, ctx| async move {
                Ok(json!({
                    "connectionId": ctx.connection_id().as_str(),
                    "userId": ctx.user_id(),
                    "sessionId": ctx.session_id,
                }))
            }),
        );
    })
}

/// Register the built-in socket routes.
pub fn register_routes(routes: &RouteTable, deployment: &str, instance: &str) {
    let deployment = deployment.to_string();
    let instance = instance.to_string();

    routes.add(
        "GET",
        "/relay/status",
        HandlerChain::new().then(route_fn(move |req| {
            let body = json!({
                "deployment": deployment,
                "instance": instance,
                "userId": req.user_id(),
                "sessionId": req.session_id,
            });
            async move { Ok(Flow::Respond(RouteReply::send(body))) }
        })),
    );

    routes.add(
        "POST",
        "/relay/echo",
        HandlerChain::new().then(route_fn(|req| async move {
            Ok(Flow::Respond(RouteReply::send(json!({
                "query": req.query,
                "body": req.body,
            }))))
        })),
    );
}

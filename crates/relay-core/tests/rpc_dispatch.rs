mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{connection, RevokedIdentity};
use relay_core::collaborators::{
    AclRequirement, GroupAuthorizer, PassthroughIdentity, ReplyingErrorReporter,
};
use relay_core::rpc::{
    handler_fn, CallContext, CallContextHook, CallOutcome, CallRegistry, RpcDispatcher,
};
use relay_core::{Principal, RelayError};
use serde_json::{json, Value};

fn dispatcher(calls: &Arc<CallRegistry>) -> RpcDispatcher {
    RpcDispatcher::new(
        calls.clone(),
        Arc::new(PassthroughIdentity),
        Arc::new(GroupAuthorizer),
    )
}

fn echo() -> Arc<dyn relay_core::rpc::CallHandler> {
    handler_fn(|args, _ctx| async move { Ok(Value::Array(args)) })
}

#[tokio::test]
async fn test_unmatched_call_sends_nothing() {
    let calls = Arc::new(CallRegistry::new());
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(1), "nobody.home", vec![])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Unmatched]);
    assert!(handle.inbox.frames().is_empty());
}

#[tokio::test]
async fn test_concurrent_calls_keep_their_correlation_ids() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "slow.echo",
            handler_fn(|args, _ctx| async move {
                let delay = args.first().and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(json!({ "waited": delay }))
            }),
        );
    });
    let dispatcher = dispatcher(&calls);
    let (conn, handle) = connection("c1", None, "s1");

    let (a, b) = tokio::join!(
        dispatcher.dispatch(&conn, json!("a"), "slow.echo", vec![json!(60)]),
        dispatcher.dispatch(&conn, json!("b"), "slow.echo", vec![json!(5)]),
    );
    assert_eq!(a, vec![CallOutcome::Responded]);
    assert_eq!(b, vec![CallOutcome::Responded]);

    let replies = handle.inbox.replies();
    assert_eq!(replies.len(), 2);
    // b finishes first but each reply carries its own id and payload.
    assert_eq!(replies[0], (json!("b"), json!({ "waited": 5 })));
    assert_eq!(replies[1], (json!("a"), json!({ "waited": 60 })));
}

#[tokio::test]
async fn test_every_registration_under_a_path_runs() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register("multi", handler_fn(|_a, _c| async { Ok(json!("first")) }))
            .register("multi", handler_fn(|_a, _c| async { Ok(json!("second")) }));
    });
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(9), "multi", vec![])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Responded, CallOutcome::Responded]);
    let mut payloads: Vec<Value> = handle.inbox.replies().into_iter().map(|(_, p)| p).collect();
    payloads.sort_by_key(|v| v.to_string());
    assert_eq!(payloads, vec![json!("first"), json!("second")]);
}

#[tokio::test]
async fn test_denied_registration_is_silent() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register_with_acl(
            "admin.only",
            AclRequirement::Groups(vec!["admin".into()]),
            echo(),
        )
        .register("admin.only", handler_fn(|_a, _c| async { Ok(json!("public")) }));
    });
    let (conn, handle) = connection("c1", Some(Principal::new("bob")), "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(1), "admin.only", vec![json!("x")])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Denied, CallOutcome::Responded]);
    assert_eq!(handle.inbox.replies(), vec![(json!(1), json!("public"))]);
}

#[tokio::test]
async fn test_authorized_principal_reaches_handler() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register_with_acl(
            "admin.only",
            AclRequirement::Groups(vec!["admin".into()]),
            handler_fn(|_args, ctx| async move { Ok(json!(ctx.user_id())) }),
        );
    });
    let admin = Principal::new("alice").with_groups(["admin"]);
    let (conn, handle) = connection("c1", Some(admin), "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(2), "admin.only", vec![])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Responded]);
    assert_eq!(handle.inbox.replies(), vec![(json!(2), json!("alice"))]);
}

#[tokio::test]
async fn test_identity_refresh_failure_denies() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register("echo", echo());
    });
    let dispatcher = RpcDispatcher::new(
        calls,
        Arc::new(RevokedIdentity),
        Arc::new(GroupAuthorizer),
    );
    let (conn, handle) = connection("c1", Some(Principal::new("mallory")), "s1");

    let outcomes = dispatcher.dispatch(&conn, json!(1), "echo", vec![]).await;

    assert_eq!(outcomes, vec![CallOutcome::Denied]);
    assert!(handle.inbox.frames().is_empty());
}

#[tokio::test]
async fn test_handler_error_is_silent_without_reporter() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "broken",
            handler_fn(|_a, _c| async { Err(anyhow::anyhow!("database unavailable")) }),
        );
    });
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(1), "broken", vec![])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Failed]);
    assert!(handle.inbox.frames().is_empty());
}

#[tokio::test]
async fn test_error_reporter_may_reply() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "broken",
            handler_fn(|_a, _c| async { Err(anyhow::anyhow!("boom")) }),
        );
    });
    let dispatcher = dispatcher(&calls).with_error_reporter(Arc::new(ReplyingErrorReporter));
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher.dispatch(&conn, json!("e"), "broken", vec![]).await;

    assert_eq!(outcomes, vec![CallOutcome::Failed]);
    let replies = handle.inbox.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].0, json!("e"));
    assert_eq!(replies[0].1["error"]["path"], json!("broken"));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "panics",
            handler_fn(|args, _c| async move {
                if args.is_empty() {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }),
        )
        .register("panics", handler_fn(|_a, _c| async { Ok(json!("survivor")) }));
    });
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher(&calls)
        .dispatch(&conn, json!(1), "panics", vec![])
        .await;

    assert_eq!(outcomes, vec![CallOutcome::Failed, CallOutcome::Responded]);
    assert_eq!(handle.inbox.replies(), vec![(json!(1), json!("survivor"))]);
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "hangs",
            handler_fn(|_a, _c| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            }),
        );
    });
    let dispatcher = dispatcher(&calls).with_handler_timeout(Duration::from_millis(50));
    let (conn, handle) = connection("c1", None, "s1");

    let outcomes = dispatcher.dispatch(&conn, json!(1), "hangs", vec![]).await;

    assert_eq!(outcomes, vec![CallOutcome::Failed]);
    assert!(handle.inbox.frames().is_empty());
}

struct TenantHook;

#[async_trait]
impl CallContextHook for TenantHook {
    async fn extend(&self, ctx: &mut CallContext) -> Result<(), RelayError> {
        ctx.extensions.insert("tenant".into(), json!("acme"));
        Ok(())
    }
}

#[tokio::test]
async fn test_context_hook_extends_call_context() {
    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register(
            "whoami",
            handler_fn(|_a, ctx| async move {
                Ok(json!({
                    "tenant": ctx.extension("tenant"),
                    "session": ctx.session_id,
                    "path": ctx.path,
                }))
            }),
        );
    });
    let dispatcher = dispatcher(&calls).with_hook(Arc::new(TenantHook));
    let (conn, handle) = connection("c1", None, "s1");

    dispatcher.dispatch(&conn, json!(1), "whoami", vec![]).await;

    assert_eq!(
        handle.inbox.replies(),
        vec![(json!(1), json!({"tenant": "acme", "session": "s1", "path": "whoami"}))]
    );
}

#[tokio::test]
async fn test_dispatch_sees_table_swaps() {
    let calls = Arc::new(CallRegistry::new());
    let dispatcher = dispatcher(&calls);
    let (conn, _handle) = connection("c1", None, "s1");

    assert_eq!(
        dispatcher.dispatch(&conn, json!(1), "late", vec![]).await,
        vec![CallOutcome::Unmatched]
    );

    calls.update(|b| {
        b.register("late", echo());
    });
    assert_eq!(
        dispatcher.dispatch(&conn, json!(2), "late", vec![]).await,
        vec![CallOutcome::Responded]
    );
}

#[tokio::test]
async fn test_reply_to_closed_connection_is_dropped() {
    use relay_core::ConnectionHandle;

    let calls = Arc::new(CallRegistry::new());
    calls.update(|b| {
        b.register("echo", echo());
    });
    let (conn, handle) = connection("c1", None, "s1");
    handle.close();

    let outcomes = dispatcher(&calls).dispatch(&conn, json!(1), "echo", vec![]).await;

    assert_eq!(outcomes, vec![CallOutcome::Responded]);
    assert!(handle.inbox.frames().is_empty());
}

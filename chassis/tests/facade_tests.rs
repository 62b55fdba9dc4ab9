//! End-to-end checks through the `chassis` facade.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chassis::chassis_rpc::error::CodecError;
use chassis::prelude::*;
use chassis::{args, kwargs};
use futures::FutureExt;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: i64,
    y: i64,
}

fn point_table() -> TranslationTable {
    TranslationTable::new().with(
        1,
        |p: &Point| Value::Array(vec![Value::Int(p.x), Value::Int(p.y)]),
        |v| match v.as_array() {
            Some([x, y]) => Ok(Point {
                x: x.as_i64().unwrap_or_default(),
                y: y.as_i64().unwrap_or_default(),
            }),
            _ => Err(CodecError::Decode("point must be a pair".into())),
        },
    )
}

#[test]
fn test_custom_extension_type_round_trip() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();

    let handler = Namespace::new().endpoint(
        Endpoint::new("mirror", Signature::positional(["p"]), |a| {
            let p = a
                .require("p")?
                .as_object::<Point>()
                .copied()
                .ok_or_else(|| ParametersError::new("p must be a point"))?;
            Ok(Object::new(Point { x: -p.x, y: -p.y }))
        })
        .unwrap(),
    );

    let reply = lp
        .run_until(async {
            let _server = serve_rpc(
                &lp,
                handler,
                RpcServerConfig::new()
                    .context(ctx.clone())
                    .bind("inproc://geometry")
                    .translation_table(point_table()),
            )
            .await
            .unwrap();
            let client = connect_rpc(
                &lp,
                RpcClientConfig::new()
                    .context(ctx)
                    .connect("inproc://geometry")
                    .translation_table(point_table()),
            )
            .await
            .unwrap();
            client
                .call()
                .attr("mirror")
                .call(args![Object::new(Point { x: 3, y: -4 })], kwargs! {})
                .await
        })
        .unwrap()
        .unwrap();

    assert_eq!(reply.as_object::<Point>(), Some(&Point { x: -3, y: 4 }));
}

#[test]
fn test_unregistered_extension_type_fails_locally() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();

    let client = lp
        .run_until(connect_rpc(
            &lp,
            RpcClientConfig::new().context(ctx).connect("inproc://nobody"),
        ))
        .unwrap()
        .unwrap();

    let result = client
        .call()
        .attr("mirror")
        .call(args![Object::new(Point { x: 0, y: 0 })], kwargs! {})
        .now_or_never();
    assert!(matches!(result, Some(Err(CallError::Codec(_)))));
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_patterns_share_one_loop() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let events = Rc::new(RefCell::new(Vec::new()));

    let log = |tag: &'static str| {
        let events = events.clone();
        Endpoint::new("log", Signature::positional(["msg"]), move |a| {
            events.borrow_mut().push(format!("{tag}:{}", a.str("msg")?));
            Ok(())
        })
        .unwrap()
    };

    lp.run_until(async {
        let _rpc = serve_rpc(
            &lp,
            Namespace::new().endpoint(log("rpc")),
            RpcServerConfig::new().context(ctx.clone()).bind("inproc://rpc"),
        )
        .await
        .unwrap();
        let _pipe = serve_pipeline(
            &lp,
            Namespace::new().endpoint(log("pipe")),
            PipelineServerConfig::new().context(ctx.clone()).bind("inproc://pipe"),
        )
        .await
        .unwrap();
        let _sub = serve_pubsub(
            &lp,
            Namespace::new().endpoint(log("sub")),
            PubSubServerConfig::new()
                .context(ctx.clone())
                .bind("inproc://pub")
                .subscribe(""),
        )
        .await
        .unwrap();

        let rpc = connect_rpc(&lp, RpcClientConfig::new().context(ctx.clone()).connect("inproc://rpc"))
            .await
            .unwrap();
        let pipe = connect_pipeline(
            &lp,
            PipelineClientConfig::new().context(ctx.clone()).connect("inproc://pipe"),
        )
        .await
        .unwrap();
        let publisher = connect_pubsub(&lp, PubSubClientConfig::new().context(ctx).connect("inproc://pub"))
            .await
            .unwrap();

        pipe.notify().attr("log").call(args!["a"], kwargs! {}).await.unwrap();
        publisher.publish("t").attr("log").call(args!["b"], kwargs! {}).await.unwrap();
        let reply = rpc.call().attr("log").call(args!["c"], kwargs! {}).await.unwrap();
        assert!(reply.is_nil());

        for _ in 0..100 {
            if events.borrow().len() == 3 {
                break;
            }
            lp.sleep(Duration::from_millis(1)).await;
        }
    })
    .unwrap();

    let mut seen = events.borrow().clone();
    seen.sort();
    assert_eq!(seen, ["pipe:a", "rpc:c", "sub:b"]);
}

#[test]
fn test_dev_tracing_is_idempotent() {
    chassis::dev_tracing::init_tracing();
    chassis::dev_tracing::init_tracing();
}

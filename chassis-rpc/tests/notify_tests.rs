//! Pipeline and publish-subscribe scenarios over the in-memory backend.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chassis_core::prelude::{Context, EventLoop};
use chassis_rpc::prelude::*;
use chassis_rpc::{args, kwargs};
use futures::FutureExt;

type Queue = Rc<RefCell<Vec<Value>>>;

fn recorder(queue: &Queue, name: &str) -> Endpoint {
    let queue = queue.clone();
    Endpoint::new(name, Signature::positional(["value"]), move |a| {
        queue.borrow_mut().push(a.require("value")?.clone());
        Ok(())
    })
    .unwrap()
}

async fn wait_until(lp: &EventLoop, cond: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        lp.sleep(Duration::from_millis(1)).await;
    }
    false
}

#[test]
fn test_pipeline_record() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let queue = Queue::default();

    let server = lp
        .run_until(serve_pipeline(
            &lp,
            Namespace::new().endpoint(recorder(&queue, "record")),
            PipelineServerConfig::new().context(ctx.clone()).bind("inproc://work"),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_pipeline(
            &lp,
            PipelineClientConfig::new().context(ctx).connect("inproc://work"),
        ))
        .unwrap()
        .unwrap();

    let sent = client.notify().attr("record").call(args![42], kwargs! {});
    assert!(matches!(sent.now_or_never(), Some(Ok(()))));

    assert!(lp.run_until(wait_until(&lp, || !queue.borrow().is_empty())).unwrap());
    assert_eq!(*queue.borrow(), [Value::Int(42)]);

    client.close();
    server.close();
    lp.run_until(server.wait_closed()).unwrap();
}

#[test]
fn test_pipeline_survives_bad_calls() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let queue = Queue::default();

    let _server = lp
        .run_until(serve_pipeline(
            &lp,
            Namespace::new()
                .endpoint(recorder(&queue, "record"))
                .endpoint(
                    Endpoint::new("answer", Signature::new(), |_| Ok(42)).unwrap(),
                )
                .endpoint(
                    Endpoint::new("fail", Signature::new(), |_| {
                        Err::<(), _>(HandlerError::new("app::Broken", vec![], "broken"))
                    })
                    .unwrap(),
                ),
            PipelineServerConfig::new()
                .context(ctx.clone())
                .bind("inproc://bad")
                .log_exceptions(true),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_pipeline(&lp, PipelineClientConfig::new().context(ctx).connect("inproc://bad")))
        .unwrap()
        .unwrap();

    let notify = client.notify();
    for call in [
        notify.attr("missing").call(args![], kwargs! {}),
        notify.attr("record").call(args![1, 2], kwargs! {}),
        notify.attr("answer").call(args![], kwargs! {}),
        notify.attr("fail").call(args![], kwargs! {}),
        notify.attr("record").call(args!["last"], kwargs! {}),
    ] {
        assert!(matches!(call.now_or_never(), Some(Ok(()))));
    }

    assert!(lp.run_until(wait_until(&lp, || !queue.borrow().is_empty())).unwrap());
    assert_eq!(*queue.borrow(), [Value::from("last")]);
}

/// Collects formatted log lines.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_pipeline_honours_excluded_error_types() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let lp = EventLoop::new().unwrap();
        let ctx = Context::memory();
        let queue = Queue::default();
        let failing = |name: &str, type_name: &'static str| {
            Endpoint::new(name, Signature::new(), move |_| {
                Err::<(), _>(HandlerError::new(type_name, vec![], "broken"))
            })
            .unwrap()
        };

        let _server = lp
            .run_until(serve_pipeline(
                &lp,
                Namespace::new()
                    .endpoint(recorder(&queue, "record"))
                    .endpoint(failing("quiet", "app::Expected"))
                    .endpoint(failing("loud", "app::Broken")),
                PipelineServerConfig::new()
                    .context(ctx.clone())
                    .bind("inproc://excluded")
                    .log_exceptions(true)
                    .exclude_log_exceptions(["app::Expected", "chassis_rpc::NotFoundError"]),
            ))
            .unwrap()
            .unwrap();
        let client = lp
            .run_until(connect_pipeline(
                &lp,
                PipelineClientConfig::new().context(ctx).connect("inproc://excluded"),
            ))
            .unwrap()
            .unwrap();

        let notify = client.notify();
        for call in [
            notify.attr("quiet").call(args![], kwargs! {}),
            notify.attr("loud").call(args![], kwargs! {}),
            notify.attr("missing").call(args![], kwargs! {}),
            notify.attr("record").call(args!["done"], kwargs! {}),
        ] {
            assert!(matches!(call.now_or_never(), Some(Ok(()))));
        }
        assert!(lp.run_until(wait_until(&lp, || !queue.borrow().is_empty())).unwrap());
        lp.run_until(lp.sleep(Duration::from_millis(10))).unwrap();
    });

    let logs = String::from_utf8_lossy(&capture.0.lock().unwrap()).into_owned();
    assert!(!logs.contains("\"quiet\""), "{logs}");
    assert!(logs.contains("An exception from method \"loud\""), "{logs}");
    // Dispatch failures are logged whatever the exclusions say.
    assert!(logs.contains("Call to \"missing\" rejected"), "{logs}");
}

#[test]
fn test_pipeline_call_after_close_fails() {
    let lp = EventLoop::new().unwrap();
    let client = lp
        .run_until(connect_pipeline(
            &lp,
            PipelineClientConfig::new().context(Context::memory()).connect("inproc://gone"),
        ))
        .unwrap()
        .unwrap();
    client.close();
    lp.run_until(client.wait_closed()).unwrap();

    let result = client.notify().attr("record").call(args![1], kwargs! {}).now_or_never();
    assert!(matches!(result, Some(Err(CallError::ServiceClosed(_)))));
}

#[test]
fn test_pubsub_topic_filtering() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let temperature = Queue::default();
    let humidity = Queue::default();

    let _server = lp
        .run_until(serve_pubsub(
            &lp,
            Namespace::new()
                .endpoint(recorder(&temperature, "report"))
                .namespace("humidity", Namespace::new().endpoint(recorder(&humidity, "report"))),
            PubSubServerConfig::new()
                .context(ctx.clone())
                .bind("inproc://sensors")
                .subscribe("temperature"),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_pubsub(
            &lp,
            PubSubClientConfig::new().context(ctx).connect("inproc://sensors"),
        ))
        .unwrap()
        .unwrap();

    client
        .publish("humidity")
        .attr("report")
        .call(args![55], kwargs! {})
        .now_or_never()
        .unwrap()
        .unwrap();
    client
        .publish("temperature")
        .attr("report")
        .call(args![21.5], kwargs! {})
        .now_or_never()
        .unwrap()
        .unwrap();

    assert!(lp.run_until(wait_until(&lp, || !temperature.borrow().is_empty())).unwrap());
    lp.run_until(lp.sleep(Duration::from_millis(10))).unwrap();
    assert_eq!(*temperature.borrow(), [Value::Float(21.5)]);
    assert!(humidity.borrow().is_empty());
}

#[test]
fn test_pubsub_subscribe_later_and_empty_topic() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let queue = Queue::default();

    let server = lp
        .run_until(serve_pubsub(
            &lp,
            Namespace::new().endpoint(recorder(&queue, "event")),
            PubSubServerConfig::new().context(ctx.clone()).bind("inproc://events"),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_pubsub(&lp, PubSubClientConfig::new().context(ctx).connect("inproc://events")))
        .unwrap()
        .unwrap();

    let publish = |n: i64| {
        client
            .publish(None::<&str>)
            .attr("event")
            .call(args![n], kwargs! {})
            .now_or_never()
            .unwrap()
            .unwrap();
    };

    publish(1);
    lp.run_until(lp.sleep(Duration::from_millis(10))).unwrap();
    assert!(queue.borrow().is_empty());

    server.transport().unwrap().subscribe("").unwrap();
    publish(2);
    assert!(lp.run_until(wait_until(&lp, || !queue.borrow().is_empty())).unwrap());
    assert_eq!(*queue.borrow(), [Value::Int(2)]);
}

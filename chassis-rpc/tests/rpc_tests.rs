//! Request-reply scenarios over the in-memory backend.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chassis_core::prelude::{
    create_connection, ConnectionOptions, Context, EventLoop, MqSocket, OptionValue, PollFlags,
    Protocol, SocketOption, SocketType, Transport,
};
use chassis_rpc::codec::Codec;
use chassis_rpc::prelude::*;
use chassis_rpc::rpc::{RequestHeader, ResponseHeader};
use chassis_rpc::{args, kwargs, GenericError};
use chrono::NaiveDate;

fn add_endpoint() -> Endpoint {
    Endpoint::new(
        "add",
        Signature::new()
            .param(Param::new("a").annotate(coerce::int()))
            .param(Param::new("b").annotate(coerce::int()))
            .returns(coerce::int()),
        |a| {
            let (x, y) = (a.int("a")?, a.int("b")?);
            x.checked_add(y)
                .ok_or_else(|| HandlerError::new("calc::Overflow", args![x, y], "integer overflow"))
        },
    )
    .unwrap()
}

fn calculator(lp: &EventLoop) -> Namespace {
    let sleeper = lp.clone();
    Namespace::new()
        .endpoint(add_endpoint())
        .endpoint(
            Endpoint::new_async(
                "slow",
                Signature::new().param(Param::new("ms").annotate(coerce::int())),
                move |a| {
                    let lp = sleeper.clone();
                    let ms = a.int("ms");
                    async move {
                        lp.sleep(Duration::from_millis(ms? as u64)).await;
                        Ok::<_, HandlerError>("slept")
                    }
                },
            )
            .unwrap(),
        )
        .endpoint(
            Endpoint::new("deny", Signature::new(), |_| {
                Err::<(), _>(io::Error::new(io::ErrorKind::PermissionDenied, "no access").into())
            })
            .unwrap(),
        )
        .endpoint(
            Endpoint::new("overdraw", Signature::positional(["amount"]), |a| {
                Err::<(), _>(HandlerError::new(
                    "bank::Overdrawn",
                    vec![a.require("amount")?.clone()],
                    "account overdrawn",
                ))
            })
            .unwrap(),
        )
        .endpoint(
            Endpoint::new("next_day", Signature::positional(["day"]), |a| {
                let day = a
                    .require("day")?
                    .as_object::<NaiveDate>()
                    .copied()
                    .ok_or_else(|| ParametersError::new("day must be a date"))?;
                Ok(Object::new(day.succ_opt().unwrap_or(day)))
            })
            .unwrap(),
        )
        .namespace("ns", Namespace::new().namespace("sub", Namespace::new().endpoint(add_endpoint())))
}

fn setup(lp: &EventLoop, endpoint: &str) -> (Service, RpcClient) {
    let ctx = Context::memory();
    let server = lp
        .run_until(serve_rpc(
            lp,
            calculator(lp),
            RpcServerConfig::new().context(ctx.clone()).bind(endpoint),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_rpc(lp, RpcClientConfig::new().context(ctx).connect(endpoint)))
        .unwrap()
        .unwrap();
    (server, client)
}

#[test]
fn test_add_round_trip() {
    let lp = EventLoop::new().unwrap();
    let (server, client) = setup(&lp, "inproc://calc");

    let sum = lp
        .run_until(client.call().attr("add").call(args![1, 2], kwargs! {}))
        .unwrap()
        .unwrap();
    assert_eq!(sum, Value::Int(3));

    let nested = lp
        .run_until(client.call().path("ns.sub.add").call(args![40], kwargs! { "b" => "2" }))
        .unwrap()
        .unwrap();
    assert_eq!(nested, Value::Int(42));

    client.close();
    server.close();
    lp.run_until(client.wait_closed()).unwrap();
    lp.run_until(server.wait_closed()).unwrap();
}

#[test]
fn test_round_trip_over_tcp_wildcard() {
    let lp = EventLoop::new().unwrap();
    let server = lp
        .run_until(serve_rpc(
            &lp,
            calculator(&lp),
            RpcServerConfig::new().context(Context::new()).bind("tcp://127.0.0.1:*"),
        ))
        .unwrap()
        .unwrap();
    let endpoint = server.transport().unwrap().bindings().into_iter().next().unwrap();
    assert!(!endpoint.ends_with('*'));
    let port: u16 = endpoint.rsplit(':').next().unwrap().parse().unwrap();
    std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    let client = lp
        .run_until(connect_rpc(
            &lp,
            RpcClientConfig::new().context(Context::new()).connect(endpoint.as_str()),
        ))
        .unwrap()
        .unwrap();
    let sum = lp
        .run_until(client.call().attr("add").call(args![], kwargs! { "a" => 5, "b" => 6 }))
        .unwrap()
        .unwrap();
    assert_eq!(sum.as_i64(), Some(11));
}

/// ROUTER that answers every request with `2 * req_id`, echoing the id.
#[derive(Default)]
struct EchoIdServer {
    transport: RefCell<Option<Transport>>,
    seen: RefCell<Vec<u32>>,
}

impl Protocol for EchoIdServer {
    fn connection_made(&self, transport: Transport) {
        *self.transport.borrow_mut() = Some(transport);
    }

    fn connection_lost(&self, _exc: Option<io::Error>) {}

    fn msg_received(&self, msg: Vec<Bytes>) {
        let header = RequestHeader::decode(&msg[1]).unwrap();
        assert_eq!(&msg[2][..], b"whoami");
        self.seen.borrow_mut().push(header.req_id);
        let reply = ResponseHeader {
            pid: 1,
            nonce: 2,
            req_id: header.req_id,
            timestamp: 0.0,
            is_error: false,
        };
        let payload = Codec::default().pack(&Value::from(header.req_id * 2)).unwrap();
        let transport = self.transport.borrow();
        transport
            .as_ref()
            .unwrap()
            .write(vec![msg[0].clone(), reply.encode(), payload])
            .unwrap();
    }
}

#[test]
fn test_reply_header_echoes_request_id() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let (_, server) = lp
        .run_until(create_connection(
            &lp,
            EchoIdServer::default,
            SocketType::Router,
            ConnectionOptions::new().context(ctx.clone()).bind("inproc://ids"),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_rpc(&lp, RpcClientConfig::new().context(ctx).connect("inproc://ids")))
        .unwrap()
        .unwrap();

    let first = client.call().attr("whoami").call(args![], kwargs! {});
    let second = client.call().attr("whoami").call(args![], kwargs! {});
    let (a, b) = (first.request_id().unwrap(), second.request_id().unwrap());
    assert_ne!(a, b);

    let replies = lp.run_until(futures::future::join(first, second)).unwrap();
    assert_eq!(replies.0.unwrap().as_u64(), Some(u64::from(a) * 2));
    assert_eq!(replies.1.unwrap().as_u64(), Some(u64::from(b) * 2));
    assert_eq!(*server.seen.borrow(), [a, b]);
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_dispatch_failure_reports_full_name() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://dispatch");

    let err = lp
        .run_until(client.call().path("ns.missing.add").call(args![1, 2], kwargs! {}))
        .unwrap()
        .unwrap_err();
    let not_found = err.downcast_ref::<NotFoundError>().unwrap();
    assert_eq!(not_found.name, "ns.missing.add");

    let err = lp
        .run_until(client.call().attr("ns").call(args![], kwargs! {}))
        .unwrap()
        .unwrap_err();
    assert!(err.downcast_ref::<NotFoundError>().is_some());
}

#[test]
fn test_annotation_and_binding_failures() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://params");

    let err = lp
        .run_until(client.call().attr("add").call(args!["not-an-int", 2], kwargs! {}))
        .unwrap()
        .unwrap_err();
    let params = err.downcast_ref::<ParametersError>().unwrap();
    assert!(params.message.contains("'a'"), "{}", params.message);

    let err = lp
        .run_until(client.call().attr("add").call(args![1], kwargs! {}))
        .unwrap()
        .unwrap_err();
    let params = err.downcast_ref::<ParametersError>().unwrap();
    assert!(params.message.contains("missing a required argument: 'b'"));
}

#[test]
fn test_empty_method_name() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://empty");
    let err = lp
        .run_until(client.call().call(args![], kwargs! {}))
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CallError::EmptyMethodName));
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_remote_errors_are_translated() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://errors");

    let err = lp
        .run_until(client.call().attr("deny").call(args![], kwargs! {}))
        .unwrap()
        .unwrap_err();
    let io_err = err.downcast_ref::<io::Error>().unwrap();
    assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
    assert_eq!(io_err.to_string(), "no access");

    let err = lp
        .run_until(client.call().attr("overdraw").call(args![5], kwargs! {}))
        .unwrap()
        .unwrap_err();
    match err {
        CallError::Generic(GenericError { type_name, args, repr }) => {
            assert_eq!(type_name, "bank::Overdrawn");
            assert_eq!(args, vec![Value::Int(5)]);
            assert_eq!(repr, "Overdrawn(5)");
        }
        other => panic!("expected a generic error, got {other:?}"),
    }
}

#[test]
fn test_add_overflow_is_a_remote_error() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://overflow");

    let err = lp
        .run_until(client.call().attr("add").call(args![i64::MAX, 1], kwargs! {}))
        .unwrap()
        .unwrap_err();
    match err {
        CallError::Generic(GenericError { type_name, args, .. }) => {
            assert_eq!(type_name, "calc::Overflow");
            assert_eq!(args, vec![Value::Int(i64::MAX), Value::Int(1)]);
        }
        other => panic!("expected a generic error, got {other:?}"),
    }
}

#[test]
fn test_client_error_table_takes_precedence() {
    #[derive(Debug, PartialEq)]
    struct Overdrawn(i64);

    impl std::fmt::Display for Overdrawn {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "overdrawn by {}", self.0)
        }
    }

    impl std::error::Error for Overdrawn {}

    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let _server = lp
        .run_until(serve_rpc(
            &lp,
            calculator(&lp),
            RpcServerConfig::new().context(ctx.clone()).bind("inproc://bank"),
        ))
        .unwrap()
        .unwrap();
    let table = ErrorTable::new().with("bank::Overdrawn", |args: &[Value]| {
        let amount = args.first()?.as_i64()?;
        Some(Box::new(Overdrawn(amount)) as _)
    });
    let client = lp
        .run_until(connect_rpc(
            &lp,
            RpcClientConfig::new()
                .context(ctx)
                .connect("inproc://bank")
                .error_table(table),
        ))
        .unwrap()
        .unwrap();

    let err = lp
        .run_until(client.call().attr("overdraw").call(args![7], kwargs! {}))
        .unwrap()
        .unwrap_err();
    assert_eq!(err.downcast_ref::<Overdrawn>(), Some(&Overdrawn(7)));
}

#[test]
fn test_default_translation_table_round_trip() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://dates");
    let day = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();

    let next = lp
        .run_until(client.call().attr("next_day").call(args![Object::new(day)], kwargs! {}))
        .unwrap()
        .unwrap();
    assert_eq!(next.as_object::<NaiveDate>(), NaiveDate::from_ymd_opt(2024, 2, 29).as_ref());
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

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[test]
fn test_timeout_discards_late_reply() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let lp = EventLoop::new().unwrap();
        let (_server, client) = setup(&lp, "inproc://slow");

        let err = lp
            .run_until(
                client
                    .with_timeout(Duration::from_millis(20))
                    .attr("slow")
                    .call(args![150], kwargs! {}),
            )
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.cancelled_calls(), 1);

        let drained = lp
            .run_until(async {
                for _ in 0..500 {
                    if client.cancelled_calls() == 0 {
                        return true;
                    }
                    lp.sleep(Duration::from_millis(1)).await;
                }
                false
            })
            .unwrap();
        assert!(drained, "late reply never arrived");
    });

    let logs = capture.contents();
    assert!(logs.contains("has been cancelled"), "{logs}");
    assert!(!logs.contains("Unknown answer id"), "{logs}");
}

#[test]
fn test_dropped_call_is_forgotten() {
    let lp = EventLoop::new().unwrap();
    let (_server, client) = setup(&lp, "inproc://dropped");

    let call = client.call().attr("slow").call(args![5], kwargs! {});
    assert_eq!(client.pending_calls(), 1);
    drop(call);
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.cancelled_calls(), 1);

    lp.run_until(lp.sleep(Duration::from_millis(50))).unwrap();
    assert_eq!(client.cancelled_calls(), 0);
}

#[test]
fn test_connection_loss_cancels_client_call_and_server_task() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let started = Rc::new(Cell::new(false));
    let finished = Rc::new(Cell::new(false));

    let handler = {
        let (lp, started, finished) = (lp.clone(), started.clone(), finished.clone());
        Namespace::new().endpoint(
            Endpoint::new_async("hang", Signature::new(), move |_| {
                let (lp, started, finished) = (lp.clone(), started.clone(), finished.clone());
                async move {
                    started.set(true);
                    lp.sleep(Duration::from_millis(200)).await;
                    finished.set(true);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap(),
        )
    };
    let server = lp
        .run_until(serve_rpc(
            &lp,
            handler,
            RpcServerConfig::new().context(ctx.clone()).bind("inproc://hang"),
        ))
        .unwrap()
        .unwrap();
    let client = lp
        .run_until(connect_rpc(&lp, RpcClientConfig::new().context(ctx).connect("inproc://hang")))
        .unwrap()
        .unwrap();

    let call = lp.spawn_local(client.call().attr("hang").call(args![], kwargs! {}));
    for _ in 0..100 {
        if started.get() {
            break;
        }
        lp.run_until(lp.sleep(Duration::from_millis(1))).unwrap();
    }
    assert!(started.get());

    let server_closed = lp.spawn_local({
        let server = server.clone();
        async move { server.wait_closed().await }
    });
    server.transport().unwrap().abort();
    client.transport().unwrap().abort();

    let outcome = lp.run_until(call).unwrap().unwrap();
    assert!(matches!(outcome, Err(CallError::Cancelled)));
    lp.run_until(server_closed).unwrap().unwrap();
    lp.run_until(client.wait_closed()).unwrap();

    lp.run_until(lp.sleep(Duration::from_millis(250))).unwrap();
    assert!(!finished.get());
    assert!(server.is_closed());
}

/// Socket whose receives start failing once `fail` is set.
#[derive(Debug)]
struct FailingRecv {
    inner: Arc<dyn MqSocket>,
    fail: Arc<AtomicBool>,
}

impl MqSocket for FailingRecv {
    fn id(&self) -> u64 {
        self.inner.id()
    }
    fn socket_type(&self) -> SocketType {
        self.inner.socket_type()
    }
    fn fd(&self) -> io::Result<std::os::fd::RawFd> {
        self.inner.fd()
    }
    fn events(&self) -> io::Result<PollFlags> {
        self.inner.events()
    }
    fn send_multipart(&self, frames: &[Bytes]) -> io::Result<()> {
        self.inner.send_multipart(frames)
    }
    fn recv_multipart(&self) -> io::Result<Vec<Bytes>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer vanished"));
        }
        self.inner.recv_multipart()
    }
    fn bind(&self, endpoint: &str) -> io::Result<String> {
        self.inner.bind(endpoint)
    }
    fn unbind(&self, endpoint: &str) -> io::Result<()> {
        self.inner.unbind(endpoint)
    }
    fn connect(&self, endpoint: &str) -> io::Result<()> {
        self.inner.connect(endpoint)
    }
    fn disconnect(&self, endpoint: &str) -> io::Result<()> {
        self.inner.disconnect(endpoint)
    }
    fn get_option(&self, option: SocketOption) -> io::Result<OptionValue> {
        self.inner.get_option(option)
    }
    fn set_option(&self, option: SocketOption, value: OptionValue) -> io::Result<()> {
        self.inner.set_option(option, value)
    }
    fn close(&self) -> io::Result<()> {
        self.inner.close()
    }
    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[test]
fn test_fatal_read_error_fails_every_pending_call() {
    let lp = EventLoop::new().unwrap();
    let ctx = Context::memory();
    let reported = Rc::new(RefCell::new(Vec::new()));
    let sink = reported.clone();
    lp.set_exception_handler(move |_, context| {
        sink.borrow_mut()
            .push((context.message.clone(), context.error.as_ref().map(io::Error::kind)));
    });

    let _server = lp
        .run_until(serve_rpc(
            &lp,
            calculator(&lp),
            RpcServerConfig::new().context(ctx.clone()).bind("inproc://fatal"),
        ))
        .unwrap()
        .unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let socket: Arc<dyn MqSocket> = Arc::new(FailingRecv {
        inner: ctx.socket(SocketType::Dealer).unwrap(),
        fail: fail.clone(),
    });
    let client = lp
        .run_until(connect_rpc(&lp, RpcClientConfig::new().socket(socket).connect("inproc://fatal")))
        .unwrap()
        .unwrap();

    let calls = vec![
        client.call().attr("slow").call(args![20], kwargs! {}),
        client.call().attr("slow").call(args![30], kwargs! {}),
        client.call().attr("add").call(args![1, 2], kwargs! {}),
    ];
    assert_eq!(client.pending_calls(), 3);
    fail.store(true, Ordering::SeqCst);

    let outcomes = lp.run_until(futures::future::join_all(calls)).unwrap();
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        assert!(matches!(outcome, Err(CallError::Cancelled)), "{outcome:?}");
    }
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.cancelled_calls(), 0);

    lp.run_until(client.wait_closed()).unwrap();
    assert!(client.is_closed());
    assert_eq!(
        *reported.borrow(),
        [(
            "Fatal read error on zmq socket transport".to_string(),
            Some(io::ErrorKind::ConnectionReset)
        )]
    );
}

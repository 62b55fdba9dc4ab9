//! Request-reply calculator over TCP.
//!
//! Serves a small handler tree on a wildcard port and calls it from a
//! client on the same event loop.
//!
//! Run this example:
//! ```bash
//! RUST_LOG=debug cargo run --example rpc_calculator
//! ```

use std::time::Duration;

use chassis::prelude::*;
use chassis::{args, kwargs};
use chrono::{Days, NaiveDate};
use tracing::{info, warn};

fn calculator(lp: &EventLoop) -> Result<Namespace, Box<dyn std::error::Error>> {
    let int = |name: &str| Param::new(name).annotate(coerce::int());

    let lp = lp.clone();
    Ok(Namespace::new()
        .endpoint(Endpoint::new(
            "add",
            Signature::new().param(int("a")).param(int("b")),
            |a| {
                let (x, y) = (a.int("a")?, a.int("b")?);
                x.checked_add(y).ok_or_else(|| {
                    HandlerError::new(
                        "calculator::Overflow",
                        vec![Value::from(x), Value::from(y)],
                        "integer overflow",
                    )
                })
            },
        )?)
        .endpoint(Endpoint::new(
            "div",
            Signature::new().param(int("a")).param(int("b")),
            |a| {
                let (n, d) = (a.int("a")?, a.int("b")?);
                if d == 0 {
                    return Err(HandlerError::new(
                        "calculator::DivisionByZero",
                        vec![Value::from(n)],
                        "division by zero",
                    ));
                }
                Ok(n / d)
            },
        )?)
        .endpoint(Endpoint::new_async(
            "slow_square",
            Signature::new().param(int("x")),
            move |a| {
                let lp = lp.clone();
                async move {
                    let x = a.int("x")?;
                    lp.sleep(Duration::from_millis(200)).await;
                    Ok(x * x)
                }
            },
        )?)
        .namespace(
            "calendar",
            Namespace::new().endpoint(Endpoint::new(
                "tomorrow",
                Signature::positional(["day"]),
                |a| {
                    let day = a
                        .require("day")?
                        .as_object::<NaiveDate>()
                        .copied()
                        .ok_or_else(|| ParametersError::new("day must be a date"))?;
                    Ok(Object::new(day + Days::new(1)))
                },
            )?),
        ))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("=== Chassis RPC Calculator ===");

    let lp = EventLoop::new()?;
    let handler = calculator(&lp)?;

    lp.run_until(async {
        let server = serve_rpc(
            &lp,
            handler,
            RpcServerConfig::new()
                .bind("tcp://127.0.0.1:*")
                .log_exceptions(true)
                .exclude_log_exceptions(["calculator::DivisionByZero"]),
        )
        .await?;
        let addr = server
            .transport()?
            .bindings()
            .into_iter()
            .next()
            .ok_or("server has no binding")?;
        info!("[Server] Listening on {addr}");

        let client = connect_rpc(&lp, RpcClientConfig::new().connect(addr)).await?;
        let calc = client.call();

        let sum = calc.attr("add").call(args![2, 3], kwargs! {}).await?;
        info!("[Client] add(2, 3) = {sum}");

        let sum = calc.attr("add").call(args![2], kwargs! { "b" => "40" }).await?;
        info!("[Client] add(2, b=\"40\") = {sum}");

        match calc.attr("div").call(args![1, 0], kwargs! {}).await {
            Err(CallError::Generic(e)) => info!("[Client] div(1, 0) failed remotely: {e}"),
            other => warn!("[Client] unexpected div result: {other:?}"),
        }

        match calc.attr("missing").call(args![], kwargs! {}).await {
            Err(e) => info!("[Client] missing() failed: {e}"),
            Ok(v) => warn!("[Client] unexpected result: {v}"),
        }

        let today = NaiveDate::from_ymd_opt(2024, 2, 28).ok_or("bad date")?;
        let next = calc
            .path("calendar.tomorrow")
            .call(args![Object::new(today)], kwargs! {})
            .await?;
        info!("[Client] calendar.tomorrow({today}) = {next:?}");

        let impatient = client.with_timeout(Duration::from_millis(50));
        match impatient.attr("slow_square").call(args![7], kwargs! {}).await {
            Err(CallError::Timeout) => info!("[Client] slow_square timed out"),
            other => warn!("[Client] unexpected slow_square result: {other:?}"),
        }
        let square = calc.attr("slow_square").call(args![7], kwargs! {}).await?;
        info!("[Client] slow_square(7) = {square}");

        client.close();
        server.close();
        server.wait_closed().await;
        Ok::<_, Box<dyn std::error::Error>>(())
    })??;

    info!("=== Done ===");
    Ok(())
}

//! Publish-subscribe sensor feed.
//!
//! One publisher binds a PUB socket; two subscribers connect with different
//! topic prefixes. Topics are prefix-matched, so `"sensor."` sees every
//! reading while `"sensor.temp"` only sees temperatures.
//!
//! Run this example:
//! ```bash
//! cargo run --example pubsub_sensors
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use chassis::prelude::*;
use chassis::{args, kwargs};
use tracing::info;

fn reporter(name: &'static str, seen: Rc<Cell<usize>>) -> Result<Namespace, Box<dyn std::error::Error>> {
    Ok(Namespace::new().endpoint(Endpoint::new(
        "reading",
        Signature::new()
            .param(Param::new("sensor").annotate(coerce::string()))
            .param(Param::new("value").annotate(coerce::float())),
        move |a| {
            seen.set(seen.get() + 1);
            info!("[{name}] {} = {:.1}", a.str("sensor")?, a.float("value")?);
            Ok(())
        },
    )?))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("=== Chassis Pub/Sub Sensors ===");

    let lp = EventLoop::new()?;
    let all = Rc::new(Cell::new(0));
    let temps = Rc::new(Cell::new(0));
    let dashboard = reporter("dashboard", all.clone())?;
    let thermostat = reporter("thermostat", temps.clone())?;

    lp.run_until(async {
        let publisher = connect_pubsub(&lp, PubSubClientConfig::new().bind("tcp://127.0.0.1:*")).await?;
        let addr = publisher
            .transport()?
            .bindings()
            .into_iter()
            .next()
            .ok_or("publisher has no binding")?;
        info!("[Publisher] Bound to {addr}");

        let _dashboard = serve_pubsub(
            &lp,
            dashboard,
            PubSubServerConfig::new().connect(addr.clone()).subscribe("sensor."),
        )
        .await?;
        let _thermostat = serve_pubsub(
            &lp,
            thermostat,
            PubSubServerConfig::new().connect(addr).subscribe("sensor.temp"),
        )
        .await?;

        let readings = [
            ("sensor.temp", "kitchen", 21.5),
            ("sensor.humidity", "kitchen", 48.0),
            ("sensor.temp", "garage", 9.25),
            ("alerts", "smoke", 1.0),
        ];
        for (topic, sensor, value) in readings {
            publisher
                .publish(topic)
                .attr("reading")
                .call(args![sensor], kwargs! { "value" => value })
                .await?;
        }

        // let the subscribers drain their queues
        lp.sleep(Duration::from_millis(100)).await;
        publisher.close();
        Ok::<_, Box<dyn std::error::Error>>(())
    })??;

    info!(
        "=== Done: dashboard saw {}, thermostat saw {} ===",
        all.get(),
        temps.get()
    );
    Ok(())
}

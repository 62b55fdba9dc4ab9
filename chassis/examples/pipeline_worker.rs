//! Pipeline fan-out across worker threads.
//!
//! A producer binds a PUSH socket on `inproc://jobs`; each worker thread
//! runs its own event loop with a PULL server connected to it. Jobs are
//! distributed round-robin and nobody waits for replies.
//!
//! Run this example:
//! ```bash
//! cargo run --example pipeline_worker
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chassis::prelude::*;
use chassis::{args, kwargs};
use tracing::{error, info};

const WORKERS: usize = 2;
const JOBS: usize = 10;

fn run_worker(
    id: usize,
    ctx: Context,
    done: Arc<AtomicUsize>,
    ready: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error>> {
    let lp = EventLoop::new()?;
    let counter = done.clone();
    let handler = Namespace::new().endpoint(Endpoint::new(
        "resize",
        Signature::new()
            .param(Param::new("image").annotate(coerce::string()))
            .param(Param::new("width").annotate(coerce::int()).default(640)),
        move |a| {
            info!("[Worker {id}] resizing {} to {}px", a.str("image")?, a.int("width")?);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )?);

    lp.run_until(async {
        let server = serve_pipeline(
            &lp,
            handler,
            PipelineServerConfig::new().context(ctx).connect("inproc://jobs"),
        )
        .await?;
        ready.wait();

        while done.load(Ordering::SeqCst) < JOBS {
            lp.sleep(Duration::from_millis(5)).await;
        }
        server.close();
        server.wait_closed().await;
        Ok::<_, Box<dyn std::error::Error>>(())
    })??;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_thread_names(true)
        .init();

    info!("=== Chassis Pipeline Workers ===");

    let ctx = Context::new();
    let lp = EventLoop::new()?;
    let producer = lp.run_until(connect_pipeline(
        &lp,
        PipelineClientConfig::new().context(ctx.clone()).bind("inproc://jobs"),
    ))??;

    let done = Arc::new(AtomicUsize::new(0));
    let ready = Arc::new(Barrier::new(WORKERS + 1));
    let workers: Vec<_> = (0..WORKERS)
        .map(|id| {
            let (ctx, done, ready) = (ctx.clone(), done.clone(), ready.clone());
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || {
                    if let Err(e) = run_worker(id, ctx, done, ready) {
                        error!("[Worker {id}] failed: {e}");
                    }
                })
        })
        .collect::<Result<_, _>>()?;
    ready.wait();

    let notify = producer.notify();
    lp.run_until(async {
        for n in 0..JOBS {
            let image = format!("photo-{n}.png");
            let sent = if n % 2 == 0 {
                notify.attr("resize").call(args![image], kwargs! {})
            } else {
                notify.attr("resize").call(args![image], kwargs! { "width" => 1024 })
            };
            sent.await?;
        }
        Ok::<_, CallError>(())
    })??;
    info!("[Producer] queued {JOBS} jobs");

    for worker in workers {
        let _ = worker.join();
    }
    producer.close();
    info!("=== Done: {} jobs processed ===", done.load(Ordering::SeqCst));
    Ok(())
}

use std::time::Duration;

use clap::Parser;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::args::ReconcilerArgs;
use crate::reconciler::Reconciler;

mod args;
mod dispatcher;
mod endpoints;
mod err;
mod informer;
mod merger;
mod model;
mod reconciler;
mod source;
mod writer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const PROXY_READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polls `proxy_addr` until a TCP connection succeeds, then closes the
/// channel the startup sequence awaits in its step 1 (spec.md §4.6.2).
/// Kept outside the reconciler itself: it's a stand-in for whatever
/// external readiness mechanism the co-located proxy process exposes,
/// which this crate does not otherwise specify (spec.md §1, out of scope).
fn spawn_proxy_ready_poll(proxy_addr: String, cancel: CancellationToken) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            if TcpStream::connect(&proxy_addr).await.is_ok() {
                let _ = tx.send(());
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(PROXY_READY_POLL_INTERVAL) => {}
                () = cancel.cancelled() => return,
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = ReconcilerArgs::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();
    tracing::info!("Starting ghost reconciler");
    tracing::info!("CLI argument: {:?}", args);

    let client = kube::Client::try_default().await?;

    let cancel = CancellationToken::new();
    let proxy_ready = args
        .wait_proxy_ready
        .then(|| spawn_proxy_ready_poll(args.proxy_addr.clone(), cancel.clone()));

    let (reconciler, ready_rx) = Reconciler::new(client, args);

    tokio::spawn(async move {
        if ready_rx.await.is_ok() {
            tracing::info!("ready: first reload succeeded, traffic may be served");
        }
    });

    let run_cancel = cancel.clone();
    tokio::select! {
        result = reconciler.run(run_cancel, proxy_ready) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            cancel.cancel();
        }
    }

    Ok(())
}

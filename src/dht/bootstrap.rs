use super::server::Dht;
use crate::constants::SHUTDOWN_POLL_INTERVAL;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts the bootstrap coordinator on its own thread.
pub(crate) fn spawn(dht: &Arc<Dht>) -> std::io::Result<JoinHandle<()>> {
    let dht = Arc::downgrade(dht);
    std::thread::Builder::new()
        .name("dht-bootstrap".into())
        .spawn(move || run(dht))
}

/// Pings every configured host until some table is booted, retrying after a
/// delay on failure.
fn run(dht: Weak<Dht>) {
    info!("Starting DHT bootstrap");
    loop {
        let Some(strong) = dht.upgrade() else {
            return;
        };
        if strong.cancel_token().is_cancelled() {
            return;
        }

        let responded = ping_hosts(&strong);
        debug!("{} bootstrap nodes responded", responded);
        if wait_until_booted(&strong) {
            let nodes: usize = strong.stats().iter().map(|s| s.nodes()).sum();
            info!("DHT bootstrap complete, {} nodes in routing tables", nodes);
            return;
        }

        let delay = strong.config().bootstrap_retry_delay;
        let cancel = strong.cancel_token().clone();
        let runtime = strong.runtime().clone();
        drop(strong);

        warn!("DHT bootstrap incomplete, retrying in {:?}", delay);
        if sleep(&runtime, &cancel, delay) {
            return;
        }
    }
}

/// Resolves and pings the hosts on a small pool of threads. Returns how many
/// endpoints answered.
fn ping_hosts(dht: &Dht) -> usize {
    let (tx, rx) = crossbeam::channel::unbounded::<String>();
    for host in &dht.config().bootstrap_nodes {
        let _ = tx.send(host.clone());
    }
    drop(tx);

    let responded = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..dht.config().bootstrap_threads.max(1) {
            let rx = rx.clone();
            let responded = &responded;
            scope.spawn(move || {
                while let Ok(host) = rx.recv() {
                    if dht.cancel_token().is_cancelled() {
                        return;
                    }
                    for addr in resolve(dht, &host) {
                        debug!("Pinging bootstrap node {}", addr);
                        match dht.ping_endpoint(addr) {
                            Ok(()) => {
                                responded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => debug!("Bootstrap node {} did not answer: {}", addr, e),
                        }
                    }
                }
            });
        }
    });
    responded.into_inner()
}

fn resolve(dht: &Dht, host: &str) -> Vec<SocketAddr> {
    match dht.runtime().block_on(tokio::net::lookup_host(host)) {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!("Failed to resolve bootstrap node {}: {}", host, e);
            Vec::new()
        }
    }
}

/// Gives the search workers time to fill the buckets from the bootstrap
/// replies.
fn wait_until_booted(dht: &Dht) -> bool {
    let deadline = Instant::now() + dht.config().rpc_timeout * 3;
    while Instant::now() < deadline {
        if dht.is_booted() {
            return true;
        }
        if sleep(dht.runtime(), dht.cancel_token(), SHUTDOWN_POLL_INTERVAL) {
            return false;
        }
    }
    dht.is_booted()
}

/// Returns true if cancelled before `duration` elapsed.
fn sleep(runtime: &Handle, cancel: &CancellationToken, duration: Duration) -> bool {
    runtime.block_on(async {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    })
}

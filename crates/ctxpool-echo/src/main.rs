// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Line echo server on top of the context pool.
//!
//! One acceptor thread feeds free contexts, a fixed set of worker threads
//! runs one protocol step per turning context. Mostly useful for watching
//! the pool's scheduling under `RUST_LOG=ctxpool=debug`.

mod session;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use ctxpool::{ContextPool, ContextState, PoolConfig, WorkerSignal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use session::{Next, Session};

#[derive(Debug, Parser)]
#[command(name = "ctxpool-echo", version, about = "Line echo server on the context pool")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:2525")]
    listen: SocketAddr,

    /// Maximum concurrent connections.
    #[arg(long, default_value_t = 256)]
    capacity: usize,

    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Idle timeout in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workers = args.workers.max(1);
    let config = PoolConfig::default()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_contexts_per_thread(args.capacity.div_ceil(workers));
    let signal = Arc::new(WorkerSignal::new());
    let sessions = (0..args.capacity).map(|_| Session::new()).collect();
    let pool = Arc::new(
        ContextPool::new(sessions, config, signal.clone()).context("failed to create context pool")?,
    );
    pool.run().context("failed to start context pool")?;

    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        let (pool, signal) = (pool.clone(), signal.clone());
        let handle = thread::Builder::new()
            .name(format!("echo-worker-{}", id))
            .spawn(move || worker_loop(&pool, &signal))
            .context("failed to spawn worker")?;
        handles.push(handle);
    }

    let listener = TcpListener::bind(args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, capacity = args.capacity, workers, "listening");
    accept_loop(&listener, &pool);

    pool.stop();
    Ok(())
}

fn accept_loop(listener: &TcpListener, pool: &ContextPool<Session>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let Ok(Some(id)) = pool.get_context(ContextState::Free) else {
            let stats = pool.stats();
            warn!(in_use = stats.in_use, "context pool exhausted, refusing connection");
            continue;
        };
        let Some(session) = pool.context(id) else {
            continue;
        };
        if let Err(err) = session.attach(stream) {
            warn!(error = %err, "failed to set up connection");
            session.detach();
            let _ = pool.put_context(id, ContextState::Free);
            continue;
        }
        debug!(context = %id, "connection accepted");
        if let Err(err) = pool.put_context(id, ContextState::Polling) {
            warn!(error = %err, "failed to start polling");
        }
    }
}

fn worker_loop(pool: &ContextPool<Session>, signal: &WorkerSignal) {
    let timeout = pool.config().timeout;
    loop {
        let id = match pool.get_context(ContextState::Turning) {
            Ok(Some(id)) => id,
            Ok(None) => {
                signal.wait_timeout(Duration::from_millis(500));
                continue;
            }
            Err(err) => {
                warn!(error = %err, "cannot fetch turning context");
                return;
            }
        };
        let Some(session) = pool.context(id) else {
            continue;
        };

        let next = session.step(timeout);
        if next == Next::Close {
            session.detach();
            debug!(context = %id, "connection closed");
        }
        if let Err(err) = pool.put_context(id, next.target()) {
            warn!(error = %err, "failed to requeue context");
            continue;
        }
        if next == Next::Again {
            // Input is already buffered; don't wait for epoll. The
            // multiplexer may have beaten us to it.
            let _ = pool.activate(id);
        }
    }
}

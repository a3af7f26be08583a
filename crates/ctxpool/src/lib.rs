// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Connection context pool for the gateway's protocol servers.
//!
//! A fixed set of per-connection contexts multiplexed over one epoll
//! instance. Protocol plugins never touch epoll: they hand contexts to the
//! pool and pull ready ones back out.
//!
//! Components:
//! - `state`       — context state tags and polling interest
//! - `queue`       — per-state FIFO queues linked through arena indices
//! - `poller`      — epoll instance plus shutdown eventfd
//! - `pool`        — `ContextPool`, the transition API and stats
//! - `multiplexer` — epoll thread moving ready contexts to turning
//! - `scanner`     — timeout eviction and idle flush thread
//! - `workers`     — hooks into the external worker pool
//!
//! A worker loop looks like:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use ctxpool::{Connection, ContextPool, ContextState, WorkerSignal};
//! # fn step<T: Connection>(_: &T) -> ContextState { ContextState::Polling }
//! fn worker<T: Connection>(pool: &ContextPool<T>, signal: &WorkerSignal) {
//!     loop {
//!         let Ok(Some(id)) = pool.get_context(ContextState::Turning) else {
//!             signal.wait_timeout(Duration::from_millis(100));
//!             continue;
//!         };
//!         let Some(conn) = pool.context(id) else { continue };
//!         let next = step(conn);
//!         let _ = pool.put_context(id, next);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
mod multiplexer;
mod poller;
pub mod pool;
mod queue;
mod scanner;
pub mod state;
pub mod workers;

pub use config::PoolConfig;
pub use error::{InitError, TransitionError};
pub use pool::{Connection, ContextId, ContextPool, PoolStats};
pub use state::{ContextState, Interest};
pub use workers::{WorkerSignal, WorkerWaker};

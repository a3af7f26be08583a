// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The context pool and its transition API.
//!
//! A fixed arena of caller-owned connection contexts, each paired with a
//! small scheduling header and a queue link. Contexts move between five
//! queues (`free`, `polling`, `turning`, `sleeping`, `idling`), one mutex
//! each. No thread ever holds two queue locks: a context is tagged
//! `Switching` under the source lock, and the destination lock is only
//! taken after the source lock is released.
//!
//! Two internal threads drive the pool once `run` is called: the
//! multiplexer (epoll readiness → turning) and the scanner (timeouts and
//! idling → turning). Everything else goes through the methods below.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{InitError, TransitionError};
use crate::poller::Poller;
use crate::queue::{Link, StateQueue};
use crate::state::{ContextState, Interest};
use crate::workers::WorkerWaker;
use crate::{multiplexer, scanner};

/// Re-check interval while `wakeup` waits for a context to go to sleep.
const RENDEZVOUS_INTERVAL: Duration = Duration::from_millis(100);

/// Accessors the pool needs from a caller-owned context record.
pub trait Connection: Send + Sync + 'static {
    /// Socket watched while the context is polling.
    fn socket(&self) -> RawFd;
    /// Last time the connection made progress. Drives timeout eviction.
    fn last_activity(&self) -> Instant;
}

/// Index of a context inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling header kept beside each context.
pub(crate) struct Header {
    state: AtomicU8,
    interest: AtomicU8,
    /// An epoll registration is armed for this context's socket.
    monitored: AtomicBool,
}

impl Header {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ContextState::Free as u8),
            interest: AtomicU8::new(Interest::Readable as u8),
            monitored: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn interest(&self) -> Interest {
        Interest::from_u8(self.interest.load(Ordering::Acquire))
    }

    pub fn monitored(&self) -> bool {
        self.monitored.load(Ordering::Acquire)
    }

    pub fn set_monitored(&self, v: bool) {
        self.monitored.store(v, Ordering::Release);
    }
}

/// Operational snapshot. Counts are read without locking and may be
/// slightly stale under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub contexts_per_thread: usize,
    /// Contexts not sitting in the free queue.
    pub in_use: usize,
    pub sleeping: usize,
    pub turning: usize,
}

/// State shared between the pool handle, the multiplexer and the scanner.
pub(crate) struct Shared<T> {
    pub contexts: Box<[T]>,
    pub headers: Box<[Header]>,
    pub links: Box<[Link]>,
    pub free: StateQueue,
    pub polling: StateQueue,
    pub turning: StateQueue,
    pub sleeping: StateQueue,
    pub idling: StateQueue,
    pub poller: Poller,
    pub config: PoolConfig,
    waker: Arc<dyn WorkerWaker>,
    stop: AtomicBool,
    /// Interruptible sleep between scanner cycles.
    pub scan_pause: (Mutex<()>, Condvar),
    /// Notified whenever a context is put to sleep.
    sleep_rendezvous: (Mutex<()>, Condvar),
}

impl<T: Connection> Shared<T> {
    pub fn capacity(&self) -> usize {
        self.contexts.len()
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Raise the stop flag and interrupt both internal threads.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.poller.wake();
        let (lock, cvar) = &self.scan_pause;
        let _guard = lock.lock();
        cvar.notify_all();
    }

    fn queue(&self, state: ContextState) -> Option<&StateQueue> {
        if !state.is_queued() {
            return None;
        }
        match state {
            ContextState::Free => Some(&self.free),
            ContextState::Polling => Some(&self.polling),
            ContextState::Turning => Some(&self.turning),
            ContextState::Sleeping => Some(&self.sleeping),
            ContextState::Idling => Some(&self.idling),
            _ => None,
        }
    }

    fn header(&self, id: ContextId) -> Result<&Header, TransitionError> {
        self.headers
            .get(id.0)
            .ok_or(TransitionError::UnknownContext(id))
    }

    /// Wake workers for `ready` newly turning contexts: one for a single
    /// context, everybody for a batch.
    pub fn wake_workers(&self, ready: usize) {
        match ready {
            0 => {}
            1 => self.waker.wake_one(),
            _ => self.waker.wake_all(),
        }
    }

    /// Unlink `index` from `queue` if it is a member, tagging it `Switching`.
    fn take(&self, index: usize, queue: &StateQueue) -> bool {
        let mut guard = queue.lock(&self.links);
        let header = &self.headers[index];
        if header.state() != queue.state() || !self.links[index].is_linked() {
            return false;
        }
        guard.unlink(index);
        header.set_state(ContextState::Switching);
        true
    }

    /// Append a `Switching` context to the turning queue.
    pub fn push_turning(&self, index: usize) {
        let mut turning = self.turning.lock(&self.links);
        if turning.push_back(index) {
            self.headers[index].set_state(ContextState::Turning);
        } else {
            warn!(context = index, "context already queued, not moved to turning");
        }
    }

    /// Append every `Switching` context in `batch` to turning under one
    /// lock, leaving `batch` empty. Returns how many were linked.
    pub fn push_turning_batch(&self, batch: &mut Vec<usize>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mut moved = 0;
        let mut turning = self.turning.lock(&self.links);
        for index in batch.drain(..) {
            if turning.push_back(index) {
                self.headers[index].set_state(ContextState::Turning);
                moved += 1;
            } else {
                warn!(context = index, "context already queued, not moved to turning");
            }
        }
        moved
    }

    /// Link `id` into the queue for `kind`, arming epoll for polling.
    fn place(&self, id: ContextId, kind: ContextState) -> Result<(), TransitionError> {
        let queue = self.queue(kind).ok_or(TransitionError::UnsupportedKind {
            kind,
            operation: "put_context",
        })?;
        let header = self.header(id)?;
        let prior = header.state();
        {
            let mut guard = queue.lock(&self.links);
            if !guard.push_back(id.0) {
                return Err(TransitionError::WrongState {
                    id,
                    state: prior,
                    operation: "put_context",
                });
            }
            header.set_state(kind);
            match kind {
                ContextState::Polling => self.arm(id, prior == ContextState::Constructing),
                ContextState::Free => header.set_monitored(false),
                _ => {}
            }
        }
        if kind == ContextState::Sleeping {
            let (lock, cvar) = &self.sleep_rendezvous;
            let _guard = lock.lock();
            cvar.notify_all();
        }
        Ok(())
    }

    /// Register (or re-arm) the context's socket. Called under the
    /// polling lock so the multiplexer sees a consistent monitored flag.
    fn arm(&self, id: ContextId, fresh: bool) {
        let header = &self.headers[id.0];
        let fd = self.contexts[id.0].socket();
        let events = header.interest().to_epoll_events();
        let token = id.0 as u64;

        let result = if fresh {
            self.poller.add(fd, events, token)
        } else {
            match self.poller.modify(fd, events, token) {
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                    // The scanner dropped the registration on timeout.
                    debug!(context = id.0, fd, "re-adding socket removed by scanner");
                    self.poller.add(fd, events, token)
                }
                other => other,
            }
        };

        match result {
            Ok(()) => header.set_monitored(true),
            Err(err) => {
                header.set_monitored(false);
                warn!(context = id.0, fd, error = %err, "failed to arm context for polling");
            }
        }
    }

    /// Block until `id` is sleeping. Turning and switching contexts are
    /// still being processed and are waited for; anything else is refused.
    fn await_sleeping(
        &self,
        id: ContextId,
        header: &Header,
        deadline: Option<Instant>,
    ) -> Result<(), TransitionError> {
        let (lock, cvar) = &self.sleep_rendezvous;
        let mut guard = lock.lock();
        let mut logged = false;
        loop {
            match header.state() {
                ContextState::Sleeping => return Ok(()),
                ContextState::Turning | ContextState::Switching => {}
                state => {
                    return Err(TransitionError::WrongState {
                        id,
                        state,
                        operation: "wakeup",
                    })
                }
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransitionError::TimedOut(id));
                    }
                    (deadline - now).min(RENDEZVOUS_INTERVAL)
                }
                None => RENDEZVOUS_INTERVAL,
            };
            if !logged {
                debug!(context = id.0, "waiting for context to go to sleep");
                logged = true;
            }
            cvar.wait_for(&mut guard, wait);
        }
    }

    fn wakeup(
        &self,
        id: ContextId,
        kind: ContextState,
        deadline: Option<Instant>,
    ) -> Result<(), TransitionError> {
        if !matches!(
            kind,
            ContextState::Polling | ContextState::Turning | ContextState::Idling
        ) {
            return Err(TransitionError::UnsupportedKind {
                kind,
                operation: "wakeup",
            });
        }
        let header = self.header(id)?;
        loop {
            self.await_sleeping(id, header, deadline)?;
            if self.take(id.0, &self.sleeping) {
                break;
            }
            // Another waker got there first; re-evaluate its new state.
        }
        self.place(id, kind)?;
        if kind == ContextState::Turning {
            self.waker.wake_one();
        }
        Ok(())
    }
}

/// Fixed-capacity pool of connection contexts multiplexed over epoll.
///
/// Created idle with every context `Free`. `run` starts the multiplexer
/// and scanner threads; `stop` (or drop) interrupts and joins them.
pub struct ContextPool<T: Connection> {
    shared: Arc<Shared<T>>,
    started: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<T: Connection> ContextPool<T> {
    /// Take ownership of `contexts` and create the epoll instance.
    pub fn new(
        contexts: Vec<T>,
        config: PoolConfig,
        waker: Arc<dyn WorkerWaker>,
    ) -> Result<Self, InitError> {
        let poller = Poller::new()?;
        let n = contexts.len();
        let links: Box<[Link]> = (0..n).map(|_| Link::new()).collect();
        let headers: Box<[Header]> = (0..n).map(|_| Header::new()).collect();

        let free = StateQueue::new(ContextState::Free);
        {
            let mut guard = free.lock(&links);
            for index in 0..n {
                guard.push_back(index);
            }
        }

        let shared = Arc::new(Shared {
            contexts: contexts.into_boxed_slice(),
            headers,
            links,
            free,
            polling: StateQueue::new(ContextState::Polling),
            turning: StateQueue::new(ContextState::Turning),
            sleeping: StateQueue::new(ContextState::Sleeping),
            idling: StateQueue::new(ContextState::Idling),
            poller,
            config,
            waker,
            stop: AtomicBool::new(false),
            scan_pause: (Mutex::new(()), Condvar::new()),
            sleep_rendezvous: (Mutex::new(()), Condvar::new()),
        });

        Ok(Self {
            shared,
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Start the multiplexer and scanner threads.
    pub fn run(&self) -> Result<(), InitError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(InitError::AlreadyRunning);
        }

        let events = match multiplexer::event_buffer(self.shared.capacity()) {
            Ok(events) => events,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err);
            }
        };

        let mut threads = self.threads.lock();
        {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("ctxpool-epoll".to_string())
                .spawn(move || multiplexer::run(&shared, events));
            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    self.started.store(false, Ordering::Release);
                    return Err(InitError::MultiplexerThread(err));
                }
            }
        }
        {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name("ctxpool-scan".to_string())
                .spawn(move || scanner::run(&shared));
            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    drop(threads);
                    self.stop();
                    return Err(InitError::ScannerThread(err));
                }
            }
        }

        info!(
            capacity = self.shared.capacity(),
            timeout = ?self.shared.config.timeout,
            "context pool running"
        );
        Ok(())
    }

    /// Stop and join the internal threads. In-flight contexts stay where
    /// they are; callers must make sure no worker is still running
    /// protocol logic against the pool. Does nothing on a pool that was
    /// never started.
    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.shared.request_stop();

        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return;
        }
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("context pool thread panicked");
            }
        }
        info!("context pool stopped");
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow the caller's record for `id`.
    pub fn context(&self, id: ContextId) -> Option<&T> {
        self.shared.contexts.get(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = ContextId> {
        (0..self.shared.capacity()).map(ContextId)
    }

    pub fn state(&self, id: ContextId) -> Option<ContextState> {
        self.shared.headers.get(id.0).map(Header::state)
    }

    /// Whether an epoll registration is currently armed for `id`.
    pub fn is_monitored(&self, id: ContextId) -> bool {
        self.shared.headers.get(id.0).is_some_and(Header::monitored)
    }

    pub fn interest(&self, id: ContextId) -> Option<Interest> {
        self.shared.headers.get(id.0).map(Header::interest)
    }

    /// Set the readiness to wait for on the next `put_context(Polling)`.
    pub fn set_interest(&self, id: ContextId, interest: Interest) -> Result<(), TransitionError> {
        let header = self.shared.header(id)?;
        header.interest.store(interest as u8, Ordering::Release);
        Ok(())
    }

    /// Pop the head of the free or turning queue. Never blocks.
    ///
    /// A free context comes back tagged `Constructing` with the default
    /// read interest. A turning context keeps its tag while the worker
    /// holds it.
    pub fn get_context(&self, kind: ContextState) -> Result<Option<ContextId>, TransitionError> {
        let queue = match kind {
            ContextState::Free => &self.shared.free,
            ContextState::Turning => &self.shared.turning,
            _ => {
                return Err(TransitionError::UnsupportedKind {
                    kind,
                    operation: "get_context",
                })
            }
        };
        let mut guard = queue.lock(&self.shared.links);
        let Some(index) = guard.pop_front() else {
            return Ok(None);
        };
        if kind == ContextState::Free {
            let header = &self.shared.headers[index];
            header.set_state(ContextState::Constructing);
            header
                .interest
                .store(Interest::Readable as u8, Ordering::Release);
        }
        Ok(Some(ContextId(index)))
    }

    /// Append a context the caller holds to the tail of `kind`'s queue.
    ///
    /// Polling contexts are registered with epoll: `ADD` straight out of
    /// `Constructing`, `MOD` otherwise, with an `ADD` fallback when the
    /// scanner already removed the socket. Other registration failures
    /// leave the context queued but unmonitored. Putting a context into
    /// turning wakes one worker.
    pub fn put_context(&self, id: ContextId, kind: ContextState) -> Result<(), TransitionError> {
        self.shared.place(id, kind)?;
        if kind == ContextState::Turning {
            self.shared.waker.wake_one();
        }
        Ok(())
    }

    /// Move an idling context straight to turning and wake one worker.
    pub fn signal(&self, id: ContextId) -> Result<(), TransitionError> {
        self.force_turning(id, ContextState::Idling, "signal")
    }

    /// Move a polling context to turning without waiting for readiness,
    /// e.g. when input is already buffered.
    pub fn activate(&self, id: ContextId) -> Result<(), TransitionError> {
        self.force_turning(id, ContextState::Polling, "activate")
    }

    fn force_turning(
        &self,
        id: ContextId,
        from: ContextState,
        operation: &'static str,
    ) -> Result<(), TransitionError> {
        let header = self.shared.header(id)?;
        let queue = match from {
            ContextState::Idling => &self.shared.idling,
            _ => &self.shared.polling,
        };
        if !self.shared.take(id.0, queue) {
            return Err(TransitionError::WrongState {
                id,
                state: header.state(),
                operation,
            });
        }
        self.shared.push_turning(id.0);
        self.shared.waker.wake_one();
        Ok(())
    }

    /// Move a sleeping context into `kind` (polling, turning or idling).
    ///
    /// If the context is still being processed, blocks until the worker
    /// puts it to sleep.
    pub fn wakeup(&self, id: ContextId, kind: ContextState) -> Result<(), TransitionError> {
        self.shared.wakeup(id, kind, None)
    }

    /// `wakeup` that gives up after `limit`.
    pub fn wakeup_timeout(
        &self,
        id: ContextId,
        kind: ContextState,
        limit: Duration,
    ) -> Result<(), TransitionError> {
        self.shared.wakeup(id, kind, Some(Instant::now() + limit))
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            capacity: shared.capacity(),
            contexts_per_thread: shared.config.contexts_per_thread,
            in_use: shared.capacity().saturating_sub(shared.free.len()),
            sleeping: shared.sleeping.len(),
            turning: shared.turning.len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }
}

impl<T: Connection> Drop for ContextPool<T> {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

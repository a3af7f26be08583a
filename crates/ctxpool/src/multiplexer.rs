// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multiplexer thread: epoll readiness → turning queue.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::InitError;
use crate::pool::{Connection, Shared};
use crate::poller::WAKE_TOKEN;
use crate::state::ContextState;

/// `epoll_wait` bound, so the stop flag is seen even with no traffic.
const WAIT_MS: i32 = 1000;

/// Pause after a failed `epoll_wait` before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// One slot per context plus one for the shutdown eventfd.
pub(crate) fn event_buffer(capacity: usize) -> Result<Vec<libc::epoll_event>, InitError> {
    let len = capacity + 1;
    let mut events = Vec::new();
    events
        .try_reserve_exact(len)
        .map_err(|_| InitError::EventBuffer { capacity })?;
    events.resize(len, libc::epoll_event { events: 0, u64: 0 });
    Ok(events)
}

pub(crate) fn run<T: Connection>(shared: &Shared<T>, mut events: Vec<libc::epoll_event>) {
    debug!("multiplexer started");
    let mut tokens = Vec::with_capacity(events.len());
    while !shared.stopping() {
        let n = match shared.poller.wait(&mut events, WAIT_MS) {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "epoll_wait failed, retrying");
                thread::sleep(RETRY_DELAY);
                continue;
            }
        };

        tokens.clear();
        for ev in &events[..n] {
            let token = ev.u64;
            if token == WAKE_TOKEN {
                shared.poller.drain_wake();
            } else {
                tokens.push(token);
            }
        }

        let ready = shared.dispatch(&tokens);
        shared.wake_workers(ready);
    }
    debug!("multiplexer stopped");
}

impl<T: Connection> Shared<T> {
    /// Move every context named by `tokens` that is still polling and
    /// monitored into turning. Anything else is a stale event: the scanner
    /// or `activate` already moved the context on. Returns how many
    /// contexts became ready.
    pub(crate) fn dispatch(&self, tokens: &[u64]) -> usize {
        let mut ready = 0;
        for &token in tokens {
            let index = token as usize;
            if index >= self.capacity() {
                continue;
            }
            {
                let mut polling = self.polling.lock(&self.links);
                let header = &self.headers[index];
                if header.state() != ContextState::Polling || !header.monitored() {
                    debug!(context = index, state = %header.state(), "dropping stale readiness event");
                    continue;
                }
                // The one-shot registration is spent.
                header.set_monitored(false);
                polling.unlink(index);
                header.set_state(ContextState::Switching);
            }
            self.push_turning(index);
            ready += 1;
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{start_polling, test_pool};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    #[test]
    fn event_buffer_has_wake_slot() {
        assert_eq!(event_buffer(4).unwrap().len(), 5);
        assert_eq!(event_buffer(0).unwrap().len(), 1);
    }

    #[test]
    fn ready_contexts_turn_in_event_order() {
        let (pool, _) = test_pool(4);
        let a = start_polling(&pool);
        let b = start_polling(&pool);
        let c = start_polling(&pool);
        let tokens: Vec<u64> = [a, b, c].iter().map(|id| id.index() as u64).collect();

        assert_eq!(pool.shared().dispatch(&tokens), 3);
        for expected in [a, b, c] {
            assert_eq!(pool.get_context(ContextState::Turning).unwrap(), Some(expected));
            assert!(!pool.is_monitored(expected));
        }
        assert_eq!(pool.get_context(ContextState::Turning).unwrap(), None);
    }

    #[test]
    fn event_for_evicted_context_is_stale() {
        let (pool, _) = test_pool(2);
        let id = start_polling(&pool);
        let timeout = pool.config().timeout;

        let mut scratch = Vec::new();
        assert_eq!(pool.shared().scan(Instant::now() + timeout, &mut scratch), 1);
        assert_eq!(pool.state(id), Some(ContextState::Turning));

        // The old registration's event arrives after the eviction.
        assert_eq!(pool.shared().dispatch(&[id.index() as u64]), 0);
        assert_eq!(pool.stats().turning, 1);
        assert_eq!(pool.get_context(ContextState::Turning).unwrap(), Some(id));
        assert_eq!(pool.get_context(ContextState::Turning).unwrap(), None);
    }

    #[test]
    fn duplicate_event_is_dropped() {
        let (pool, _) = test_pool(1);
        let id = start_polling(&pool);
        let token = id.index() as u64;
        assert_eq!(pool.shared().dispatch(&[token, token]), 1);
        assert_eq!(pool.stats().turning, 1);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let (pool, _) = test_pool(1);
        assert_eq!(pool.shared().dispatch(&[7, 42]), 0);
    }

    #[test]
    fn wait_errors_do_not_end_the_loop() {
        let (pool, _) = test_pool(1);
        let shared = pool.shared().clone();
        // A zero-length buffer makes every epoll_wait fail with EINVAL.
        let handle = thread::spawn(move || run(&shared, Vec::new()));

        thread::sleep(Duration::from_millis(300));
        assert!(!handle.is_finished());

        pool.shared().request_stop();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "multiplexer ignored stop");
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().unwrap();
    }

    #[test]
    fn running_pool_turns_readable_socket() {
        let (pool, waker) = test_pool(2);
        pool.run().unwrap();
        let id = start_polling(&pool);
        pool.context(id).unwrap().poke();

        let deadline = Instant::now() + Duration::from_secs(2);
        while waker.one.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "context never became ready");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.state(id), Some(ContextState::Turning));
        pool.stop();
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scanner thread: timeout eviction and idle flush.
//!
//! Once per period, walks the polling queue up to the tail it saw when the
//! pass started, then drains the idling queue. Everything it pulls out is
//! collected privately and appended to turning in one go.

use std::time::Instant;

use tracing::debug;

use crate::pool::{Connection, Shared};
use crate::state::ContextState;

pub(crate) fn run<T: Connection>(shared: &Shared<T>) {
    debug!(interval = ?shared.config.scan_interval, "scanner started");
    let mut evicted = Vec::with_capacity(shared.capacity());
    while !shared.stopping() {
        let ready = shared.scan(Instant::now(), &mut evicted);
        shared.wake_workers(ready);

        let (lock, cvar) = &shared.scan_pause;
        let mut guard = lock.lock();
        if shared.stopping() {
            break;
        }
        cvar.wait_for(&mut guard, shared.config.scan_interval);
    }
    debug!("scanner stopped");
}

impl<T: Connection> Shared<T> {
    /// One scanner cycle as of `now`. Returns how many contexts moved to
    /// turning. `evicted` is scratch space and is left empty.
    pub(crate) fn scan(&self, now: Instant, evicted: &mut Vec<usize>) -> usize {
        evicted.clear();
        {
            let mut polling = self.polling.lock(&self.links);
            if let Some(tail) = polling.tail() {
                while let Some(index) = polling.pop_front() {
                    let header = &self.headers[index];
                    let context = &self.contexts[index];
                    if !header.monitored() {
                        // Readiness already fired (or arming failed) and
                        // nobody re-armed it.
                        header.set_state(ContextState::Switching);
                        evicted.push(index);
                    } else if now.saturating_duration_since(context.last_activity())
                        >= self.config.timeout
                    {
                        let fd = context.socket();
                        match self.poller.delete(fd) {
                            Ok(()) => {
                                header.set_monitored(false);
                                header.set_state(ContextState::Switching);
                                evicted.push(index);
                            }
                            Err(err) => {
                                debug!(context = index, fd, error = %err, "failed to remove timed out socket from epoll");
                                polling.push_back(index);
                            }
                        }
                    } else {
                        polling.push_back(index);
                    }
                    if index == tail {
                        break;
                    }
                }
            }
        }
        {
            let mut idling = self.idling.lock(&self.links);
            while let Some(index) = idling.pop_front() {
                self.headers[index].set_state(ContextState::Switching);
                evicted.push(index);
            }
        }

        self.push_turning_batch(evicted)
    }
}

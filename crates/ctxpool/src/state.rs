// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Context states and polling interest.
//!
//! Every context carries exactly one `ContextState` tag. The five queued
//! states (`Free`, `Polling`, `Turning`, `Sleeping`, `Idling`) each own a
//! queue; `Constructing` and `Switching` mark a context that some thread
//! holds outside of any queue.

use std::fmt;

/// Scheduling state of a context.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Unused, waiting for a new connection.
    Free = 0,
    /// Handed out by `get_context(Free)`; the caller is setting it up.
    Constructing = 1,
    /// Registered with epoll, waiting for readiness or timeout.
    Polling = 2,
    /// Between two queues. Owned by the thread moving it.
    Switching = 3,
    /// Ready for (or being processed by) a worker.
    Turning = 4,
    /// Parked until someone calls `wakeup`.
    Sleeping = 5,
    /// Wants another turn without waiting on I/O.
    Idling = 6,
}

impl ContextState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Constructing,
            2 => Self::Polling,
            4 => Self::Turning,
            5 => Self::Sleeping,
            6 => Self::Idling,
            _ => Self::Switching,
        }
    }

    /// True for the states that own a queue.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            Self::Free | Self::Polling | Self::Turning | Self::Sleeping | Self::Idling
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Constructing => "constructing",
            Self::Polling => "polling",
            Self::Switching => "switching",
            Self::Turning => "turning",
            Self::Sleeping => "sleeping",
            Self::Idling => "idling",
        };
        f.write_str(name)
    }
}

/// Readiness a polling context waits for.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interest {
    #[default]
    Readable = 1,
    Writable = 2,
    ReadWrite = 3,
}

impl Interest {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::Writable,
            3 => Self::ReadWrite,
            _ => Self::Readable,
        }
    }

    /// Edge-triggered, one-shot epoll event mask for this interest.
    pub(crate) fn to_epoll_events(self) -> u32 {
        let base = (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        match self {
            Interest::Readable => base | libc::EPOLLIN as u32,
            Interest::Writable => base | libc::EPOLLOUT as u32,
            Interest::ReadWrite => base | (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tag_roundtrip() {
        for state in [
            ContextState::Free,
            ContextState::Constructing,
            ContextState::Polling,
            ContextState::Switching,
            ContextState::Turning,
            ContextState::Sleeping,
            ContextState::Idling,
        ] {
            assert_eq!(ContextState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn only_five_states_are_queued() {
        assert!(ContextState::Free.is_queued());
        assert!(ContextState::Idling.is_queued());
        assert!(!ContextState::Constructing.is_queued());
        assert!(!ContextState::Switching.is_queued());
    }

    #[test]
    fn interest_masks_are_one_shot() {
        let oneshot = libc::EPOLLONESHOT as u32;
        let edge = libc::EPOLLET as u32;
        for interest in [Interest::Readable, Interest::Writable, Interest::ReadWrite] {
            let events = interest.to_epoll_events();
            assert_eq!(events & oneshot, oneshot);
            assert_eq!(events & edge, edge);
        }
        assert_eq!(
            Interest::ReadWrite.to_epoll_events() & (libc::EPOLLIN | libc::EPOLLOUT) as u32,
            (libc::EPOLLIN | libc::EPOLLOUT) as u32
        );
        assert_eq!(Interest::Writable.to_epoll_events() & libc::EPOLLIN as u32, 0);
    }
}

// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pool startup and transition errors.

use std::io;

use thiserror::Error;

use crate::pool::ContextId;
use crate::state::ContextState;

/// Failure to bring the pool up. The pool never enters the running state
/// when one of these is returned.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create epoll instance: {0}")]
    Epoll(#[source] io::Error),

    #[error("failed to allocate event buffer for {capacity} contexts")]
    EventBuffer { capacity: usize },

    #[error("failed to spawn multiplexer thread: {0}")]
    MultiplexerThread(#[source] io::Error),

    #[error("failed to spawn scanner thread: {0}")]
    ScannerThread(#[source] io::Error),

    #[error("failed to create shutdown eventfd: {0}")]
    WakeFd(#[source] io::Error),

    #[error("context pool was already started")]
    AlreadyRunning,
}

impl InitError {
    /// Distinct numeric code per failure point.
    pub fn code(&self) -> i32 {
        match self {
            InitError::Epoll(_) => -1,
            InitError::EventBuffer { .. } => -2,
            InitError::MultiplexerThread(_) => -3,
            InitError::ScannerThread(_) => -4,
            InitError::WakeFd(_) => -5,
            InitError::AlreadyRunning => -6,
        }
    }
}

/// A rejected transition request. The context is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The context is not in a state this operation accepts.
    #[error("cannot {operation} context {id}: it is {state}")]
    WrongState {
        id: ContextId,
        state: ContextState,
        operation: &'static str,
    },

    /// The requested target (or source) kind is not valid for this operation.
    #[error("{operation} does not accept {kind} contexts")]
    UnsupportedKind {
        kind: ContextState,
        operation: &'static str,
    },

    /// The id does not belong to this pool.
    #[error("context {0} is not part of this pool")]
    UnknownContext(ContextId),

    /// `wakeup_timeout` gave up before the context went to sleep.
    #[error("context {0} did not reach sleeping in time")]
    TimedOut(ContextId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_codes_are_distinct() {
        let errs = [
            InitError::Epoll(io::Error::from_raw_os_error(libc::EMFILE)),
            InitError::EventBuffer { capacity: 8 },
            InitError::MultiplexerThread(io::Error::from_raw_os_error(libc::EAGAIN)),
            InitError::ScannerThread(io::Error::from_raw_os_error(libc::EAGAIN)),
            InitError::WakeFd(io::Error::from_raw_os_error(libc::EMFILE)),
            InitError::AlreadyRunning,
        ];
        let mut codes: Vec<i32> = errs.iter().map(InitError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn transition_error_message() {
        let err = TransitionError::WrongState {
            id: ContextId::new(3),
            state: ContextState::Polling,
            operation: "signal",
        };
        assert_eq!(err.to_string(), "cannot signal context #3: it is polling");
    }
}

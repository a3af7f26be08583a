// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-state FIFO queues linked through arena indices.
//!
//! The link nodes live in one slice shared by all queues, indexed by
//! context. A node is only touched while holding the lock of the queue the
//! context currently belongs to, so the atomics here use relaxed ordering;
//! the queue mutex provides the happens-before edges.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::state::ContextState;

const NIL: usize = usize::MAX;

/// Doubly-linked list node for one context.
pub(crate) struct Link {
    prev: AtomicUsize,
    next: AtomicUsize,
    linked: AtomicBool,
}

impl Link {
    pub fn new() -> Self {
        Self {
            prev: AtomicUsize::new(NIL),
            next: AtomicUsize::new(NIL),
            linked: AtomicBool::new(false),
        }
    }

    /// Whether the context is currently a member of some queue.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    fn prev(&self) -> usize {
        self.prev.load(Ordering::Relaxed)
    }

    fn next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    fn set_prev(&self, v: usize) {
        self.prev.store(v, Ordering::Relaxed);
    }

    fn set_next(&self, v: usize) {
        self.next.store(v, Ordering::Relaxed);
    }
}

struct Ends {
    head: usize,
    tail: usize,
}

/// Queue for one state. Length is mirrored in an atomic so stats can
/// read it without taking the lock.
pub(crate) struct StateQueue {
    state: ContextState,
    ends: Mutex<Ends>,
    len: AtomicUsize,
}

impl StateQueue {
    pub fn new(state: ContextState) -> Self {
        Self {
            state,
            ends: Mutex::new(Ends { head: NIL, tail: NIL }),
            len: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Lock-free length snapshot.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn lock<'a>(&'a self, links: &'a [Link]) -> QueueGuard<'a> {
        QueueGuard {
            ends: self.ends.lock(),
            len: &self.len,
            links,
        }
    }
}

/// Exclusive access to one queue.
pub(crate) struct QueueGuard<'a> {
    ends: MutexGuard<'a, Ends>,
    len: &'a AtomicUsize,
    links: &'a [Link],
}

impl QueueGuard<'_> {
    /// Append `index` at the tail.
    ///
    /// Returns false without touching anything if the context is already
    /// linked into a queue (this one or another).
    pub fn push_back(&mut self, index: usize) -> bool {
        let link = &self.links[index];
        if link.linked.swap(true, Ordering::AcqRel) {
            return false;
        }
        link.set_next(NIL);
        link.set_prev(self.ends.tail);
        if self.ends.tail == NIL {
            self.ends.head = index;
        } else {
            self.links[self.ends.tail].set_next(index);
        }
        self.ends.tail = index;
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        let head = self.ends.head;
        if head == NIL {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    /// Remove `index` from this queue. The caller must know it is a member.
    pub fn unlink(&mut self, index: usize) {
        let link = &self.links[index];
        let (prev, next) = (link.prev(), link.next());
        if prev == NIL {
            self.ends.head = next;
        } else {
            self.links[prev].set_next(next);
        }
        if next == NIL {
            self.ends.tail = prev;
        } else {
            self.links[next].set_prev(prev);
        }
        link.set_prev(NIL);
        link.set_next(NIL);
        link.linked.store(false, Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tail(&self) -> Option<usize> {
        (self.ends.tail != NIL).then_some(self.ends.tail)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ends.head == NIL
    }

    /// Walk members head to tail.
    #[cfg(test)]
    pub fn members(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = self.ends.head;
        while cur != NIL {
            out.push(cur);
            cur = self.links[cur].next();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(n: usize) -> Vec<Link> {
        (0..n).map(|_| Link::new()).collect()
    }

    #[test]
    fn push_pop_is_fifo() {
        let links = links(4);
        let q = StateQueue::new(ContextState::Turning);
        let mut g = q.lock(&links);
        for i in [2, 0, 3] {
            assert!(g.push_back(i));
        }
        assert_eq!(g.members(), vec![2, 0, 3]);
        assert_eq!(g.pop_front(), Some(2));
        assert_eq!(g.pop_front(), Some(0));
        assert_eq!(g.pop_front(), Some(3));
        assert_eq!(g.pop_front(), None);
        assert!(g.is_empty());
    }

    #[test]
    fn double_link_is_refused() {
        let links = links(2);
        let a = StateQueue::new(ContextState::Polling);
        let b = StateQueue::new(ContextState::Idling);
        assert!(a.lock(&links).push_back(1));
        assert!(!b.lock(&links).push_back(1));
        assert!(!a.lock(&links).push_back(1));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn unlink_middle_head_and_tail() {
        let links = links(5);
        let q = StateQueue::new(ContextState::Sleeping);
        let mut g = q.lock(&links);
        for i in 0..5 {
            g.push_back(i);
        }
        g.unlink(2);
        assert_eq!(g.members(), vec![0, 1, 3, 4]);
        g.unlink(0);
        assert_eq!(g.members(), vec![1, 3, 4]);
        g.unlink(4);
        assert_eq!(g.members(), vec![1, 3]);
        assert_eq!(g.tail(), Some(3));
        drop(g);
        assert_eq!(q.len(), 2);
        assert!(!links[2].is_linked());
        assert!(links[3].is_linked());
    }

    #[test]
    fn relink_after_unlink() {
        let links = links(3);
        let q = StateQueue::new(ContextState::Free);
        let mut g = q.lock(&links);
        g.push_back(0);
        g.push_back(1);
        g.unlink(0);
        assert!(g.push_back(0));
        assert_eq!(g.members(), vec![1, 0]);
        assert_eq!(g.tail(), Some(0));
    }
}

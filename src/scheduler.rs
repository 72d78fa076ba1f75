//! Deadline-ordered job queue driving all delayed work.
//!
//! Single-threaded: the scheduler never sleeps, it only answers "what runs
//! now" and "when should the embedder wake us again".

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle to a scheduled job; lets the owner move or cancel it in place.
pub struct JobHandle(u64);

#[derive(Debug)]
pub struct Scheduler<T> {
    /// Jobs keyed by `(deadline, seq)`: deadline order, FIFO within a tick.
    queue: BTreeMap<(Instant, u64), T>,
    deadlines: HashMap<u64, Instant>,
    next_seq: u64,
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Scheduler {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, job: T) -> JobHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.insert((deadline, seq), job);
        self.deadlines.insert(seq, deadline);

        JobHandle(seq)
    }

    /// Move a pending job to a new deadline. Keeps its position relative to
    /// other jobs at the same deadline. No-op if the job already ran.
    pub fn edit(&mut self, handle: JobHandle, deadline: Instant) {
        if let Some(old) = self.deadlines.get_mut(&handle.0) {
            if *old == deadline {
                return;
            }
            if let Some(job) = self.queue.remove(&(*old, handle.0)) {
                self.queue.insert((deadline, handle.0), job);
                *old = deadline;
            }
        }
    }

    pub fn cancel(&mut self, handle: JobHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle.0)?;
        self.queue.remove(&(deadline, handle.0))
    }

    /// Deadline of a still-pending job.
    pub fn deadline(&self, handle: JobHandle) -> Option<Instant> {
        self.deadlines.get(&handle.0).copied()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the next job due at or before `now`, if any. Jobs scheduled for
    /// the same deadline come out in insertion order.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        let key = *self.queue.keys().next()?;
        if key.0 > now {
            return None;
        }

        self.deadlines.remove(&key.1);
        self.queue.remove(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

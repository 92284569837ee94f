//! Hand-off of control requests from remote-call threads to the loop.
//!
//! A remote-call thread pushes a [`Task`] and blocks on the [`Waiter`] it gets
//! back. The supervision loop drains the queue in FIFO order and applies each
//! task. Completing it wakes exactly that task's waiter; a task whose effect
//! takes several iterations (a stop waiting for its child to exit) keeps its
//! [`Completion`] until then. Each task
//! has its own rendezvous, so concurrent callers never see each other's
//! results.
//!
//! The queue itself has no lock: it lives inside the supervisor's shared
//! state and is guarded by the same mutex as the programs it acts on.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::config::ALL;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
        })
    }
}

/// What became of a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran against program state.
    Applied,
    /// The supervisor stopped before running the operation.
    ShuttingDown,
}

#[derive(Debug, Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    cvar: Condvar,
}

/// Submitter's end of a task's rendezvous.
#[derive(Debug)]
pub struct Waiter(Arc<Slot>);

impl Waiter {
    /// Blocks until the task is completed.
    pub fn wait(self) -> Outcome {
        let mut outcome = self
            .0
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(done) = *outcome {
                return done;
            }
            outcome = self
                .0
                .cvar
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Loop's end of a task's rendezvous. Completes exactly once: explicitly, or
/// with [`Outcome::ShuttingDown`] when dropped.
#[derive(Debug)]
pub struct Completion(Option<Arc<Slot>>);

impl Completion {
    pub fn complete(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(slot) = self.0.take() {
            *slot.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
            slot.cvar.notify_one();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(Outcome::ShuttingDown);
    }
}

fn rendezvous() -> (Completion, Waiter) {
    let slot = Arc::new(Slot::default());
    (Completion(Some(Arc::clone(&slot))), Waiter(slot))
}

/// A pending control request.
#[derive(Debug)]
pub struct Task {
    op: Operation,
    target: String,
    completion: Completion,
}

impl Task {
    pub const fn op(&self) -> Operation {
        self.op
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn targets_all(&self) -> bool {
        self.target == ALL
    }

    /// Wakes the submitter with `outcome`.
    pub fn complete(self, outcome: Outcome) {
        self.completion.complete(outcome);
    }

    /// Detaches the completion, for tasks that finish in a later iteration.
    pub fn into_completion(self) -> Completion {
        self.completion
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
    closed: bool,
}

impl TaskQueue {
    /// Queues a task, returning the handle to wait on.
    ///
    /// Returns `None` once the queue is closed; the caller should report the
    /// supervisor as shutting down.
    pub fn push(&mut self, op: Operation, target: impl Into<String>) -> Option<Waiter> {
        if self.closed {
            return None;
        }

        let (completion, waiter) = rendezvous();
        let task = Task {
            op,
            target: target.into(),
            completion,
        };
        trace!("Queued {} {:?}", task.op, task.target);
        self.pending.push_back(task);
        Some(waiter)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hands every pending task to `apply` in submission order. `apply` owns
    /// the task: it completes it now, or keeps its [`Completion`] for later.
    /// Returns how many tasks were handed over.
    pub fn drain(&mut self, mut apply: impl FnMut(Task)) -> usize {
        let mut count = 0;
        while let Some(task) = self.pending.pop_front() {
            apply(task);
            count += 1;
        }
        count
    }

    /// Refuses further tasks and completes the pending ones without running
    /// them. Returns how many were pending.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.drain(|task| task.complete(Outcome::ShuttingDown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::mpsc, thread, time::Duration};

    #[test]
    fn drains_in_submission_order() {
        let mut queue = TaskQueue::default();
        let waiters: Vec<_> = ["a", "b", "all", "c"]
            .iter()
            .map(|name| queue.push(Operation::Start, *name).unwrap())
            .collect();
        assert_eq!(queue.len(), 4);

        let mut seen = Vec::new();
        let ran = queue.drain(|task| {
            seen.push((task.target().to_string(), task.targets_all()));
            task.complete(Outcome::Applied);
        });

        assert_eq!(ran, 4);
        assert!(queue.is_empty());
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), false),
                ("b".to_string(), false),
                ("all".to_string(), true),
                ("c".to_string(), false),
            ]
        );
        for waiter in waiters {
            assert_eq!(waiter.wait(), Outcome::Applied);
        }
    }

    #[test]
    fn waiter_blocks_until_completed() {
        let mut queue = TaskQueue::default();
        let waiter = queue.push(Operation::Stop, "web").unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || tx.send(waiter.wait()).unwrap());

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        queue.drain(|task| {
            assert_eq!(task.op(), Operation::Stop);
            task.complete(Outcome::Applied);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Outcome::Applied
        );
        handle.join().unwrap();
    }

    #[test]
    fn each_waiter_gets_its_own_outcome() {
        let mut queue = TaskQueue::default();
        let first = queue.push(Operation::Start, "keep").unwrap();
        let second = queue.push(Operation::Start, "refuse").unwrap();

        let first = thread::spawn(move || first.wait());
        let second = thread::spawn(move || second.wait());

        queue.drain(|task| {
            if task.target() == "keep" {
                task.complete(Outcome::Applied);
            } else {
                task.complete(Outcome::ShuttingDown);
            }
        });

        assert_eq!(first.join().unwrap(), Outcome::Applied);
        assert_eq!(second.join().unwrap(), Outcome::ShuttingDown);
    }

    #[test]
    fn completion_can_outlive_the_drain() {
        let mut queue = TaskQueue::default();
        let waiter = queue.push(Operation::Stop, "web").unwrap();

        let mut parked = Vec::new();
        queue.drain(|task| parked.push(task.into_completion()));
        assert!(queue.is_empty());

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || tx.send(waiter.wait()).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        parked.pop().unwrap().complete(Outcome::Applied);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Outcome::Applied
        );
        handle.join().unwrap();
    }

    #[test]
    fn dropped_completion_reports_shutdown() {
        let mut queue = TaskQueue::default();
        let waiter = queue.push(Operation::Stop, "web").unwrap();
        let mut parked = Vec::new();
        queue.drain(|task| parked.push(task.into_completion()));

        drop(parked);
        assert_eq!(waiter.wait(), Outcome::ShuttingDown);
    }

    #[test]
    fn close_releases_pending_and_refuses_new() {
        let mut queue = TaskQueue::default();
        let pending = queue.push(Operation::Start, "web").unwrap();
        let waiting = thread::spawn(move || pending.wait());

        assert_eq!(queue.close(), 1);
        assert!(queue.is_closed());
        assert_eq!(waiting.join().unwrap(), Outcome::ShuttingDown);
        assert!(queue.push(Operation::Start, "web").is_none());
    }

    #[test]
    fn dropped_task_never_strands_its_waiter() {
        let mut queue = TaskQueue::default();
        let waiter = queue.push(Operation::Start, "web").unwrap();
        drop(queue);
        assert_eq!(waiter.wait(), Outcome::ShuttingDown);
    }

    #[test]
    fn operations_serialise_lowercase() {
        assert_eq!(serde_json::to_string(&Operation::Start).unwrap(), "\"start\"");
        assert_eq!(Operation::Stop.to_string(), "stop");
    }
}

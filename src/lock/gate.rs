//! FIFO admission in front of a lock object
//!
//! Threads queue their identifiers and only the head of the queue may attempt
//! a transition on the underlying [`LockObject`], so a stream of readers can
//! never starve a queued writer.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::object::LockObject;
use crate::common::{Attempt, Contention, CoordError, LockMode, Result};
use crate::interrupt::Interrupt;

#[derive(Debug)]
struct Queue {
    waiting: VecDeque<u64>,
    valid: bool,
}

pub struct LockGate {
    queue: Mutex<Queue>,
    turn: Condvar,
    object: LockObject,
    poll: Duration,
}

impl LockGate {
    pub fn new(object: LockObject, poll: Duration) -> Self {
        Self {
            queue: Mutex::new(Queue {
                waiting: VecDeque::new(),
                valid: true,
            }),
            turn: Condvar::new(),
            object,
            poll,
        }
    }

    pub fn key(&self) -> &str {
        self.object.key()
    }

    pub fn is_valid(&self) -> bool {
        self.queue.lock().valid
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().waiting.len()
    }

    fn dequeue(&self, thread_id: u64) {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.waiting.iter().position(|id| *id == thread_id) {
            queue.waiting.remove(pos);
        }
        self.turn.notify_all();
    }

    /// Wait for our turn, then enter the object
    pub fn enter(&self, thread_id: u64, mode: LockMode, interrupt: &Interrupt) -> Result<Attempt> {
        {
            let mut queue = self.queue.lock();
            if !queue.valid {
                return Ok(Attempt::Expired);
            }
            queue.waiting.push_back(thread_id);
            while queue.waiting.front() != Some(&thread_id) {
                self.turn.wait_for(&mut queue, self.poll);
                if interrupt.is_triggered() {
                    queue.waiting.retain(|id| *id != thread_id);
                    self.turn.notify_all();
                    return Err(CoordError::interrupted(format!(
                        "waiting in queue for lock '{}'",
                        self.key()
                    )));
                }
            }
        }
        let result = self.object.enter(mode, interrupt);
        self.dequeue(thread_id);
        result
    }

    /// Enter the object only if nobody is queued and it is available now
    pub fn try_enter(
        &self,
        thread_id: u64,
        mode: LockMode,
        interrupt: &Interrupt,
    ) -> Result<Attempt> {
        {
            let mut queue = self.queue.lock();
            if !queue.valid {
                return Ok(Attempt::Expired);
            }
            if !queue.waiting.is_empty() {
                return Ok(Attempt::WouldBlock(Contention::Local));
            }
            queue.waiting.push_back(thread_id);
        }
        let result = self.object.try_enter(mode, interrupt);
        self.dequeue(thread_id);
        result
    }

    pub fn leave(&self, mode: LockMode, interrupt: &Interrupt) -> Result<()> {
        self.object.leave(mode, interrupt)
    }

    /// Invalidate the gate if nobody is queued and the object is free.
    ///
    /// A retired gate reports [`Attempt::Expired`] to late callers, who then
    /// fetch a fresh gate from the pool.
    pub fn retire(&self) -> bool {
        let mut queue = self.queue.lock();
        if !queue.valid || !queue.waiting.is_empty() {
            return false;
        }
        if !self.object.invalidate_if_free() {
            return false;
        }
        queue.valid = false;
        true
    }
}

use std::collections::VecDeque;

use crate::Result;

/// Unit of deferred work run against a context `C`.
pub type Task<C> = Box<dyn FnOnce(&mut C) -> Result<()> + Send>;

/// FIFO of tasks waiting for their turn.
///
/// A task pushed while turn N is running is only popped after the task of
/// turn N has returned, so it always runs at turn N+1 or later.
pub struct TurnQueue<C> {
    tasks: VecDeque<Task<C>>,
    turns: u64,
}

impl<C> TurnQueue<C> {
    pub fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            turns: 0,
        }
    }

    pub fn push(&mut self, task: Task<C>) {
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task<C>> {
        let task = self.tasks.pop_front()?;
        self.turns += 1;
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of turns started so far.
    pub fn turns(&self) -> u64 {
        self.turns
    }
}

impl<C> Default for TurnQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A context that owns its turn queue and knows how to run one task.
pub trait Executor: Sized {
    fn turn_queue(&mut self) -> &mut TurnQueue<Self>;

    /// Runs a single turn. Implementations decide what a failed task means;
    /// a failure must not stop later turns.
    fn execute(&mut self, task: Task<Self>);

    /// Drains the queue, including tasks queued by the tasks it runs.
    fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.turn_queue().pop() {
            self.execute(task);
            ran += 1;
        }
        ran
    }
}

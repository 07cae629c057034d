use std::collections::VecDeque;

use crate::message::TaskId;

/// FIFO of task ids waiting for an idle worker.
///
/// Capacity is enforced when a task is admitted by the pool handle, so
/// every id that reaches this queue is accepted.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<TaskId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: TaskId) {
        self.tasks.push_back(id);
    }

    /// Earliest-enqueued task.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.tasks.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove every waiting id, oldest first.
    pub fn drain(&mut self) -> Vec<TaskId> {
        self.tasks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_submission_order() {
        let mut queue = TaskQueue::new();
        for id in [1, 2, 3, 4] {
            queue.push(id);
        }
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        queue.push(5);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(5));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_empties_in_order() {
        let mut queue = TaskQueue::new();
        for id in [7, 3, 9] {
            queue.push(id);
        }
        assert_eq!(queue.drain(), vec![7, 3, 9]);
        assert!(queue.is_empty());
    }
}

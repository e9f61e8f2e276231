//! Priority queue of pending task ids
//!
//! Ordered by priority first and submission order second, so equal
//! priorities are served FIFO.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::task::{TaskId, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    sequence: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // earlier submissions win ties
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_sequence: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTask {
            task_id,
            priority,
            sequence,
        });
    }

    /// Put a popped entry back without losing its place
    pub fn requeue(&mut self, entry: QueuedTask) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.task_id != task_id);
        self.heap.len() != before
    }

    /// Remove every entry, highest priority first
    pub fn drain(&mut self) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            ids.push(entry.task_id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new();
        queue.push("n1".into(), TaskPriority::Normal);
        queue.push("l1".into(), TaskPriority::Low);
        queue.push("c1".into(), TaskPriority::Critical);
        queue.push("n2".into(), TaskPriority::Normal);
        queue.push("h1".into(), TaskPriority::High);

        assert_eq!(queue.drain(), vec!["c1", "h1", "n1", "n2", "l1"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_position() {
        let mut queue = TaskQueue::new();
        queue.push("a".into(), TaskPriority::Normal);
        queue.push("b".into(), TaskPriority::Normal);

        let first = queue.pop().unwrap();
        assert_eq!(first.task_id, "a");
        queue.requeue(first);
        assert_eq!(queue.pop().unwrap().task_id, "a");
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        queue.push("a".into(), TaskPriority::Normal);
        queue.push("b".into(), TaskPriority::High);

        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
    }
}

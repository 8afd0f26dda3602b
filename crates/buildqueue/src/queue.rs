//! Bounded FIFO of operations waiting for a worker.

use crate::{Error, OperationName, Result};
use std::collections::VecDeque;

/// Where an operation goes when its worker's lease expires mid-execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Ahead of everything queued, bounding latency for work that was
    /// already running.
    #[default]
    Front,
    /// Behind everything queued, like a fresh submission.
    Back,
}

pub(crate) struct PendingQueue {
    entries: VecDeque<OperationName>,
    capacity: usize,
}

impl PendingQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits a new operation at the back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when `capacity` operations are queued.
    pub(crate) fn push_back(&mut self, name: OperationName) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(name);
        Ok(())
    }

    /// Puts back an operation whose worker went away, without ever exceeding
    /// `capacity`.
    ///
    /// When the queue is full, [`RequeuePolicy::Front`] displaces the entry
    /// at the back to make room, and [`RequeuePolicy::Back`] turns `name`
    /// itself away. Either way the operation left without a place is
    /// returned.
    pub(crate) fn requeue(
        &mut self,
        name: OperationName,
        policy: RequeuePolicy,
    ) -> Option<OperationName> {
        if self.entries.len() < self.capacity {
            match policy {
                RequeuePolicy::Front => self.entries.push_front(name),
                RequeuePolicy::Back => self.entries.push_back(name),
            }
            return None;
        }

        match policy {
            RequeuePolicy::Front => match self.entries.pop_back() {
                Some(displaced) => {
                    self.entries.push_front(name);
                    Some(displaced)
                }
                None => Some(name),
            },
            RequeuePolicy::Back => Some(name),
        }
    }

    /// Removes and returns the oldest entry accepted by `is_compatible`.
    pub(crate) fn take_first<F>(&mut self, mut is_compatible: F) -> Option<OperationName>
    where
        F: FnMut(&OperationName) -> bool,
    {
        let index = self.entries.iter().position(|name| is_compatible(name))?;
        self.entries.remove(index)
    }

    pub(crate) fn remove(&mut self, name: &OperationName) -> bool {
        match self.entries.iter().position(|queued| queued == name) {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &OperationName> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(queue: &PendingQueue) -> Vec<&str> {
        queue.iter().map(OperationName::as_str).collect()
    }

    #[test]
    fn admission_fails_fast_at_capacity() {
        let mut queue = PendingQueue::new(2);
        queue.push_back("a".into()).unwrap();
        queue.push_back("b".into()).unwrap();

        assert_eq!(
            queue.push_back("c".into()),
            Err(Error::QueueFull { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn zero_capacity_rejects_everything() {
        let mut queue = PendingQueue::new(0);
        assert!(queue.push_back("a".into()).is_err());
    }

    #[test]
    fn take_first_skips_incompatible_entries_in_order() {
        let mut queue = PendingQueue::new(4);
        for name in ["gpu-1", "cpu-1", "cpu-2"] {
            queue.push_back(name.into()).unwrap();
        }

        let taken = queue.take_first(|name| name.as_str().starts_with("cpu"));
        assert_eq!(taken, Some("cpu-1".into()));
        assert_eq!(names(&queue), ["gpu-1", "cpu-2"]);

        assert_eq!(queue.take_first(|name| name.as_str() == "tpu"), None);
    }

    #[test]
    fn requeue_honors_policy() {
        let mut queue = PendingQueue::new(3);
        queue.push_back("fresh".into()).unwrap();

        assert_eq!(queue.requeue("front".into(), RequeuePolicy::Front), None);
        assert_eq!(queue.requeue("back".into(), RequeuePolicy::Back), None);
        assert_eq!(names(&queue), ["front", "fresh", "back"]);
    }

    #[test]
    fn front_requeue_into_a_full_queue_displaces_the_newest_entry() {
        let mut queue = PendingQueue::new(2);
        queue.push_back("older".into()).unwrap();
        queue.push_back("newer".into()).unwrap();

        let displaced = queue.requeue("expired".into(), RequeuePolicy::Front);
        assert_eq!(displaced, Some("newer".into()));
        assert_eq!(names(&queue), ["expired", "older"]);
        assert_eq!(queue.len(), queue.capacity());
    }

    #[test]
    fn back_requeue_into_a_full_queue_is_turned_away() {
        let mut queue = PendingQueue::new(1);
        queue.push_back("fresh".into()).unwrap();

        let rejected = queue.requeue("expired".into(), RequeuePolicy::Back);
        assert_eq!(rejected, Some("expired".into()));
        assert_eq!(names(&queue), ["fresh"]);
    }

    #[test]
    fn remove_drops_a_single_entry() {
        let mut queue = PendingQueue::new(3);
        queue.push_back("a".into()).unwrap();
        queue.push_back("b".into()).unwrap();

        assert!(queue.remove(&"a".into()));
        assert!(!queue.remove(&"a".into()));
        assert_eq!(names(&queue), ["b"]);
    }
}

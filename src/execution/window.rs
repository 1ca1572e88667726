//! Admission window and reorder buffer of the concurrent stage

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded set of outstanding units of work
///
/// A permit is taken when an event is admitted and released when its result
/// is forwarded, so completed-but-unforwarded results count against the
/// window too.
#[derive(Debug, Clone)]
pub struct AdmissionWindow {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot; None once the window has been closed
    pub async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Refuse every further admission, waking up waiters
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Units admitted and not yet forwarded
    pub fn outstanding(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }
}

/// Holds completed results until every earlier position has been released
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next_position: u64,
    completed: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next_position: 0,
            completed: BTreeMap::new(),
        }
    }

    /// Store a completed result
    ///
    /// Positions are unique: a position already released or already held is
    /// handed back as an error.
    pub fn insert(&mut self, position: u64, item: T) -> Result<(), T> {
        if position < self.next_position || self.completed.contains_key(&position) {
            return Err(item);
        }
        self.completed.insert(position, item);
        Ok(())
    }

    /// Take the next result in sequence, if it has completed
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.completed.remove(&self.next_position)?;
        let position = self.next_position;
        self.next_position += 1;
        Some((position, item))
    }

    /// The position that has to complete before anything else is released
    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_releases_in_sequence_only() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(2, "c").unwrap();
        buffer.insert(1, "b").unwrap();
        assert_eq!(buffer.pop_ready(), None);
        assert_eq!(buffer.len(), 2);

        buffer.insert(0, "a").unwrap();
        assert_eq!(buffer.pop_ready(), Some((0, "a")));
        assert_eq!(buffer.pop_ready(), Some((1, "b")));
        assert_eq!(buffer.pop_ready(), Some((2, "c")));
        assert_eq!(buffer.pop_ready(), None);
        assert_eq!(buffer.next_position(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_and_released_positions() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, 'x').unwrap();
        assert_eq!(buffer.insert(0, 'y'), Err('y'));
        buffer.pop_ready();
        assert_eq!(buffer.insert(0, 'z'), Err('z'));
    }

    #[tokio::test]
    async fn test_window_counts_outstanding() {
        let window = AdmissionWindow::new(2);
        let first = window.admit().await.unwrap();
        let _second = window.admit().await.unwrap();
        assert_eq!(window.outstanding(), 2);

        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), window.admit()).await;
        assert!(waiting.is_err(), "third admission must wait");

        drop(first);
        assert_eq!(window.outstanding(), 1);
        assert!(window.admit().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_window_refuses() {
        let window = AdmissionWindow::new(1);
        window.close();
        assert!(window.is_closed());
        assert!(window.admit().await.is_none());
    }
}

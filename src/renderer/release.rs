// Epoch-tagged resource release
//
// Buffers and images handed back to the renderer may still be referenced by
// frames in flight. Each one is tagged with the epoch of the frame being
// recorded and dropped once a frame fence covering that epoch has been
// waited on.

use std::collections::VecDeque;
use std::fmt;

use crate::backend::buffer::{BufferKind, GpuBuffer};
use crate::backend::GpuImage;

/// A GPU object whose drop frees device memory
pub trait GpuResource: fmt::Debug {}

impl<K: BufferKind> GpuResource for GpuBuffer<K> {}
impl GpuResource for GpuImage {}

#[derive(Debug)]
pub struct ReleaseQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> Default for ReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReleaseQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Tag `item` with `epoch`. Epochs must not decrease.
    pub fn push(&mut self, epoch: u64, item: T) {
        debug_assert!(self.entries.back().map_or(true, |(last, _)| *last <= epoch));
        self.entries.push_back((epoch, item));
    }

    /// Drop everything tagged at or before `completed`; returns how many
    pub fn release_completed(&mut self, completed: u64) -> usize {
        let mut released = 0;
        while self
            .entries
            .front()
            .map_or(false, |(epoch, _)| *epoch <= completed)
        {
            self.entries.pop_front();
            released += 1;
        }
        released
    }

    /// Drop everything. The device must be idle.
    pub fn drain(&mut self) -> usize {
        let released = self.entries.len();
        self.entries.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked(u32, Rc<RefCell<Vec<u32>>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    #[test]
    fn releases_only_completed_epochs() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ReleaseQueue::new();
        queue.push(3, Tracked(1, Rc::clone(&dropped)));
        queue.push(3, Tracked(2, Rc::clone(&dropped)));
        queue.push(5, Tracked(3, Rc::clone(&dropped)));

        assert_eq!(queue.release_completed(2), 0);
        assert!(dropped.borrow().is_empty());

        assert_eq!(queue.release_completed(4), 2);
        assert_eq!(*dropped.borrow(), vec![1, 2]);

        assert_eq!(queue.release_completed(4), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_drops_everything() {
        let dropped = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ReleaseQueue::new();
        queue.push(10, Tracked(1, Rc::clone(&dropped)));
        queue.push(11, Tracked(2, Rc::clone(&dropped)));

        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        assert_eq!(dropped.borrow().len(), 2);
    }
}

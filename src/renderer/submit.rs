// Deferred command buffer submission
//
// Work recorded through `Renderer::queue_submit` waits here until the next
// flush. A flush submits the pending work with one submit per queue type
// (transfer, compute, graphics), keeping enqueue order, and tags it with the
// frame epoch it belongs to. Submitted work is freed only once a frame fence
// covering that epoch has been waited, however many flushes happen meanwhile.

use anyhow::{Context, Result};
use ash::vk;

use crate::backend::sync::FrameSync;
use crate::backend::{QueueType, VulkanDevice};

/// Anything that knows which queue it must be submitted to
pub trait QueuedWork {
    fn queue_type(&self) -> QueueType;
}

/// A recorded one-shot command buffer and the pool it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedCommandBuffer {
    pub buffer: vk::CommandBuffer,
    pub pool: vk::CommandPool,
    pub queue: QueueType,
}

impl QueuedWork for QueuedCommandBuffer {
    fn queue_type(&self) -> QueueType {
        self.queue
    }
}

impl QueuedCommandBuffer {
    /// Record `record` into a fresh one-shot buffer from this thread's pool
    pub fn record<F>(device: &VulkanDevice, queue: QueueType, record: F) -> Result<Self>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let pool = device.command_pool_for(queue)?;
        let buffer = device.allocate_command_buffer(true, queue)?;
        let raw = &device.device;

        let recorded = record(raw, buffer).and_then(|()| {
            let ended = unsafe { raw.end_command_buffer(buffer) };
            ended.context("Failed to end queued command buffer")
        });
        if let Err(err) = recorded {
            unsafe { raw.free_command_buffers(pool, &[buffer]) };
            return Err(err);
        }

        Ok(Self { buffer, pool, queue })
    }

    pub fn free(self, device: &ash::Device) {
        unsafe { device.free_command_buffers(self.pool, &[self.buffer]) };
    }
}

/// Submit one queue type's batch.
///
/// Transfer and compute batches signal a semaphore from `sync` that the next
/// primary submit of that slot waits on. Graphics batches are ordered before
/// the primary by the queue itself.
pub fn submit_batch(
    device: &VulkanDevice,
    sync: &mut FrameSync,
    queue: QueueType,
    batch: &[QueuedCommandBuffer],
) -> Result<()> {
    let buffers: Vec<vk::CommandBuffer> = batch.iter().map(|queued| queued.buffer).collect();
    let signal = match queue {
        QueueType::Graphics => None,
        _ => Some(sync.signal_queued(&device.device)?),
    };
    let signals: Vec<vk::Semaphore> = signal.into_iter().collect();

    let submit_info = vk::SubmitInfo::builder()
        .command_buffers(&buffers)
        .signal_semaphores(&signals)
        .build();

    let submitted = unsafe {
        device
            .device
            .queue_submit(device.queue(queue), &[submit_info], vk::Fence::null())
    };
    if let Err(err) = submitted {
        if let Some(semaphore) = signal {
            sync.cancel_queued(semaphore);
        }
        return Err(err).with_context(|| format!("Failed to submit queued {:?} work", queue));
    }

    log::trace!("Submitted {} queued {:?} command buffers", buffers.len(), queue);
    Ok(())
}

#[derive(Debug)]
struct InFlight<C> {
    work: C,
    epoch: u64,
}

#[derive(Debug)]
pub struct SubmissionQueue<C> {
    pending: Vec<C>,
    in_flight: Vec<InFlight<C>>,
}

impl<C> Default for SubmissionQueue<C> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            in_flight: Vec::new(),
        }
    }
}

impl<C: QueuedWork> SubmissionQueue<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, work: C) {
        self.pending.push(work);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Submit everything pending as part of frame `epoch`.
    ///
    /// `submit` is called once per non-empty queue type. A batch whose submit
    /// failed stays pending, unchanged, and is tried again at the next flush;
    /// the first error is returned after every batch has been tried.
    pub fn flush<E, S>(&mut self, epoch: u64, mut submit: S) -> Result<usize, E>
    where
        S: FnMut(QueueType, &[C]) -> Result<(), E>,
    {
        let mut pending = std::mem::take(&mut self.pending);
        let mut submits = 0;
        let mut first_error = None;

        for queue in QueueType::ALL {
            let (batch, rest): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|work| work.queue_type() == queue);
            pending = rest;
            if batch.is_empty() {
                continue;
            }

            match submit(queue, &batch) {
                Ok(()) => {
                    submits += 1;
                    self.in_flight
                        .extend(batch.into_iter().map(|work| InFlight { work, epoch }));
                }
                Err(err) => {
                    self.pending.extend(batch);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(submits),
        }
    }

    /// Free submitted work whose epoch is `<= completed`; returns the count
    pub fn release_completed(&mut self, completed: u64, mut free: impl FnMut(C)) -> usize {
        let (done, alive): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|entry| entry.epoch <= completed);
        self.in_flight = alive;

        let released = done.len();
        for entry in done {
            free(entry.work);
        }
        released
    }

    /// Free everything, submitted or not. The device must be idle.
    pub fn drain(&mut self, mut free: impl FnMut(C)) {
        self.pending.drain(..).for_each(&mut free);
        self.in_flight.drain(..).for_each(|entry| free(entry.work));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Work(u32, QueueType);

    impl QueuedWork for Work {
        fn queue_type(&self) -> QueueType {
            self.1
        }
    }

    fn accept(_: QueueType, _: &[Work]) -> Result<(), ()> {
        Ok(())
    }

    /// Frame loop as the renderer drives it: each begin_frame waits the fence
    /// of the frame `max` epochs back, each end_frame flushes.
    struct FrameLoop {
        queue: SubmissionQueue<Work>,
        max: u64,
        epoch: u64,
        freed: Vec<(u64, u32)>,
    }

    impl FrameLoop {
        fn new(max: u64) -> Self {
            Self {
                queue: SubmissionQueue::new(),
                max,
                epoch: 0,
                freed: Vec::new(),
            }
        }

        fn begin_frame(&mut self) {
            if let Some(completed) = self.epoch.checked_sub(self.max) {
                let epoch = self.epoch;
                let freed = &mut self.freed;
                self.queue
                    .release_completed(completed, |work| freed.push((epoch, work.0)));
            }
        }

        fn flush(&mut self) {
            self.queue.flush(self.epoch, accept).unwrap();
        }

        fn end_frame(&mut self) {
            self.flush();
            self.epoch += 1;
        }
    }

    #[test]
    fn same_queue_work_goes_out_in_one_ordered_submit() {
        let mut queue = SubmissionQueue::new();
        for id in 0..3 {
            queue.enqueue(Work(id, QueueType::Transfer));
        }

        let mut submits = Vec::new();
        let count = queue
            .flush::<(), _>(0, |q, batch| {
                submits.push((q, batch.to_vec()));
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].0, QueueType::Transfer);
        assert_eq!(
            submits[0].1,
            vec![
                Work(0, QueueType::Transfer),
                Work(1, QueueType::Transfer),
                Work(2, QueueType::Transfer)
            ]
        );
    }

    #[test]
    fn queue_types_submit_transfer_compute_graphics() {
        let mut queue = SubmissionQueue::new();
        queue.enqueue(Work(0, QueueType::Graphics));
        queue.enqueue(Work(1, QueueType::Transfer));
        queue.enqueue(Work(2, QueueType::Compute));
        queue.enqueue(Work(3, QueueType::Graphics));

        let mut order = Vec::new();
        queue
            .flush::<(), _>(0, |q, batch| {
                order.push((q, batch.iter().map(|w| w.0).collect::<Vec<_>>()));
                Ok(())
            })
            .unwrap();

        assert_eq!(
            order,
            vec![
                (QueueType::Transfer, vec![1]),
                (QueueType::Compute, vec![2]),
                (QueueType::Graphics, vec![0, 3]),
            ]
        );
    }

    #[test]
    fn submitted_work_is_freed_once_when_its_frame_completes() {
        let mut frames = FrameLoop::new(3);

        frames.begin_frame();
        frames.queue.enqueue(Work(7, QueueType::Transfer));
        frames.end_frame();

        for _ in 0..8 {
            frames.begin_frame();
            frames.end_frame();
        }

        // flushed in frame 0, its fence is first waited by begin_frame of frame 3
        assert_eq!(frames.freed, vec![(3, 7)]);
        assert_eq!(frames.queue.in_flight_len(), 0);
    }

    #[test]
    fn extra_flushes_do_not_free_work_early() {
        for max in 1..=5 {
            let mut frames = FrameLoop::new(max);

            frames.begin_frame();
            frames.queue.enqueue(Work(1, QueueType::Transfer));
            frames.flush();
            frames.flush();
            frames.end_frame();

            for _ in 0..max + 2 {
                frames.begin_frame();
                frames.flush();
                frames.flush();
                frames.end_frame();
            }

            assert_eq!(frames.freed, vec![(max, 1)], "max frames in flight {}", max);
        }
    }

    #[test]
    fn work_flushed_between_frames_belongs_to_the_next_frame() {
        let mut frames = FrameLoop::new(2);
        frames.begin_frame();
        frames.end_frame();

        // setup-time flush outside begin/end
        frames.queue.enqueue(Work(4, QueueType::Compute));
        frames.flush();

        for _ in 0..4 {
            frames.begin_frame();
            frames.end_frame();
        }

        assert_eq!(frames.freed, vec![(3, 4)]);
    }

    #[test]
    fn failed_batch_stays_pending_and_is_retried() {
        let mut queue = SubmissionQueue::new();
        queue.enqueue(Work(0, QueueType::Transfer));
        queue.enqueue(Work(1, QueueType::Graphics));

        let result = queue.flush(0, |q, _| {
            if q == QueueType::Transfer {
                Err("transfer queue lost")
            } else {
                Ok(())
            }
        });

        assert_eq!(result, Err("transfer queue lost"));
        assert_eq!(queue.in_flight_len(), 1);
        assert_eq!(queue.pending_len(), 1);

        let mut resubmitted = Vec::new();
        queue
            .flush::<(), _>(1, |q, batch| {
                resubmitted.push((q, batch.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(resubmitted, vec![(QueueType::Transfer, vec![Work(0, QueueType::Transfer)])]);

        let mut freed = Vec::new();
        queue.release_completed(0, |work| freed.push(work.0));
        assert_eq!(freed, vec![1]);
        queue.release_completed(1, |work| freed.push(work.0));
        assert_eq!(freed, vec![1, 0]);
    }

    #[test]
    fn drain_frees_pending_and_in_flight() {
        let mut queue = SubmissionQueue::new();
        queue.enqueue(Work(0, QueueType::Compute));
        queue.flush(0, accept).unwrap();
        queue.enqueue(Work(1, QueueType::Compute));

        let mut freed = Vec::new();
        queue.drain(|work| freed.push(work.0));
        freed.sort();
        assert_eq!(freed, vec![0, 1]);
    }
}

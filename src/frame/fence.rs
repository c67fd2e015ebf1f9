// Fence timeline
//
// CPU-side submission counter paired with the GPU-reported completed value.
// A value V guards whatever was submitted before it: resources are safe
// to reuse once completed >= V.

use std::time::Duration;

use super::GpuFence;
use crate::error::{FrameError, FrameResult};

pub struct FenceTimeline<F: GpuFence> {
    fence: F,
    /// Last value handed to the queue. Never decreases.
    submitted: u64,
}

impl<F: GpuFence> FenceTimeline<F> {
    pub fn new(fence: F) -> Self {
        Self {
            fence,
            submitted: 0,
        }
    }

    /// Enqueue a signal for the next value and return it.
    ///
    /// The GPU reports the value once everything submitted before this
    /// call has finished; signals resolve in submission order.
    pub fn signal(&mut self) -> FrameResult<u64> {
        let value = self.submitted + 1;
        self.fence.signal(value)?;
        self.submitted = value;
        log::trace!("Fence signal queued: {}", value);
        Ok(value)
    }

    /// Block until the GPU reaches `value`, or fail with a stall after `timeout`.
    ///
    /// Returns immediately without touching the wait primitive when the
    /// value has already been reached. `None` waits forever.
    pub fn wait_until(&self, value: u64, timeout: Option<Duration>) -> FrameResult<()> {
        if self.fence.completed_value()? >= value {
            return Ok(());
        }

        if self.fence.wait_for(value, timeout)? {
            return Ok(());
        }

        let completed = self.fence.completed_value()?;
        if completed >= value {
            // Completed right at the deadline
            return Ok(());
        }

        Err(FrameError::Stall {
            value,
            completed,
            timeout: timeout.unwrap_or(Duration::MAX),
        })
    }

    /// Signal and wait for that signal: all previously submitted work is done
    /// when this returns. Forces the GPU idle, so never use per frame.
    pub fn drain(&mut self) -> FrameResult<u64> {
        let value = self.signal()?;
        self.wait_until(value, None)?;
        log::debug!("Fence drained at {}", value);
        Ok(value)
    }

    pub fn completed(&self) -> FrameResult<u64> {
        self.fence.completed_value()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn is_complete(&self, value: u64) -> FrameResult<bool> {
        Ok(self.fence.completed_value()? >= value)
    }

    /// Signaled values the GPU has not reached yet.
    pub fn outstanding(&self) -> FrameResult<u64> {
        Ok(self.submitted.saturating_sub(self.fence.completed_value()?))
    }

    pub fn fence(&self) -> &F {
        &self.fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::mock::{Event, MockGpu};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_values_strictly_increase() {
        let gpu = MockGpu::new(true);
        let mut timeline = FenceTimeline::new(gpu.fence());

        let mut last = 0;
        for _ in 0..100 {
            let value = timeline.signal().unwrap();
            assert!(value > last);
            last = value;
        }
        assert_eq!(timeline.submitted(), 100);
    }

    #[test]
    fn test_wait_on_reached_value_does_not_block() {
        let gpu = MockGpu::new(true);
        let mut timeline = FenceTimeline::new(gpu.fence());
        let value = timeline.signal().unwrap();

        timeline.wait_until(value, Some(Duration::ZERO)).unwrap();

        // Satisfied values never reach the OS wait
        assert!(!gpu.events().iter().any(|e| matches!(e, Event::Wait(_))));
    }

    #[test]
    fn test_wait_times_out_as_stall() {
        let gpu = MockGpu::new(false);
        let mut timeline = FenceTimeline::new(gpu.fence());
        let value = timeline.signal().unwrap();

        let err = timeline
            .wait_until(value, Some(Duration::from_millis(20)))
            .unwrap_err();
        match err {
            FrameError::Stall {
                value: v,
                completed,
                ..
            } => {
                assert_eq!(v, value);
                assert_eq!(completed, 0);
            }
            other => panic!("expected stall, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_wakes_when_gpu_advances() {
        let gpu = MockGpu::new(false);
        let mut timeline = FenceTimeline::new(gpu.fence());
        let value = timeline.signal().unwrap();

        let remote = gpu.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.complete_to(value);
        });

        timeline.wait_until(value, Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        handle.join().unwrap();
    }

    #[test]
    fn test_drain_waits_for_everything() {
        let gpu = MockGpu::new(true);
        let mut timeline = FenceTimeline::new(gpu.fence());
        timeline.signal().unwrap();
        timeline.signal().unwrap();

        let drained = timeline.drain().unwrap();
        assert_eq!(drained, 3);
        assert_eq!(timeline.completed().unwrap(), 3);
        assert_eq!(timeline.outstanding().unwrap(), 0);
    }
}

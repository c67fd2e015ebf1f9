// Scripted test backend
//
// The fence only advances when told to (or instantly in auto mode), and
// every queue/swapchain call is appended to one shared event log so tests
// can check ordering.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    CommandRecorder, Extent, GpuFence, ImageState, PresentMode, PresentOutcome, Presenter,
    PresenterOptions, Swapchain,
};
use crate::error::{FrameError, FrameResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Signal(u64),
    Wait(u64),
    Reset(usize),
    Transition(usize, ImageState, ImageState),
    Clear(usize),
    Close(usize),
    Execute(usize, MockImage),
    Present(PresentMode),
    Acquire(usize),
    Resize(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MockImage {
    pub index: usize,
    pub generation: u32,
}

struct Shared {
    completed: Mutex<u64>,
    completed_cv: Condvar,
    signaled: AtomicU64,
    auto_complete: AtomicBool,
    stale_next_present: AtomicBool,
    out_of_date_next_acquire: AtomicBool,
    stall_next_acquire: AtomicBool,
    events: Mutex<Vec<Event>>,
}

/// Test-side handle onto the fake GPU.
#[derive(Clone)]
pub(crate) struct MockGpu {
    shared: Arc<Shared>,
}

impl MockGpu {
    pub fn new(auto_complete: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                completed: Mutex::new(0),
                completed_cv: Condvar::new(),
                signaled: AtomicU64::new(0),
                auto_complete: AtomicBool::new(auto_complete),
                stale_next_present: AtomicBool::new(false),
                out_of_date_next_acquire: AtomicBool::new(false),
                stall_next_acquire: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fence(&self) -> MockFence {
        MockFence {
            shared: self.shared.clone(),
        }
    }

    pub fn swapchain(&self, image_count: usize) -> MockSwapchain {
        MockSwapchain {
            shared: self.shared.clone(),
            image_count,
            extent: Extent::new(1280, 720),
            generation: 0,
            rotation: (0..image_count).collect(),
            position: 0,
        }
    }

    pub fn recorder(&self) -> MockRecorder {
        MockRecorder {
            shared: self.shared.clone(),
        }
    }

    /// Pretend the GPU finished everything up to `value`.
    pub fn complete_to(&self, value: u64) {
        let mut completed = self.shared.completed.lock();
        if value > *completed {
            *completed = value;
        }
        self.shared.completed_cv.notify_all();
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.shared.auto_complete.store(enabled, Ordering::SeqCst);
    }

    pub fn completed(&self) -> u64 {
        *self.shared.completed.lock()
    }

    /// Highest value the CPU has asked the queue to signal.
    pub fn signaled(&self) -> u64 {
        self.shared.signaled.load(Ordering::SeqCst)
    }

    pub fn mark_next_present_stale(&self) {
        self.shared.stale_next_present.store(true, Ordering::SeqCst);
    }

    pub fn mark_next_acquire_out_of_date(&self) {
        self.shared.out_of_date_next_acquire.store(true, Ordering::SeqCst);
    }

    /// The next acquire times out, as a hung presentation engine would.
    pub fn mark_next_acquire_stalled(&self) {
        self.shared.stall_next_acquire.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().clear();
    }

    /// Presenter over this GPU with `slots` images and the given stall timeout.
    pub fn presenter(
        &self,
        slots: usize,
        stall_timeout: Option<Duration>,
    ) -> Presenter<MockFence, MockSwapchain, MockRecorder> {
        let options = PresenterOptions {
            frames_in_flight: slots,
            stall_timeout,
            vsync: true,
            tearing_supported: false,
            clear_color: [1.0, 0.0, 0.0, 0.0],
        };
        Presenter::new(self.fence(), self.swapchain(slots), self.recorder(), options)
            .expect("mock presenter")
    }

    fn log(shared: &Shared, event: Event) {
        shared.events.lock().push(event);
    }
}

pub(crate) struct MockFence {
    shared: Arc<Shared>,
}

impl GpuFence for MockFence {
    fn signal(&mut self, value: u64) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Signal(value));
        self.shared.signaled.fetch_max(value, Ordering::SeqCst);
        if self.shared.auto_complete.load(Ordering::SeqCst) {
            let mut completed = self.shared.completed.lock();
            *completed = (*completed).max(value);
            self.shared.completed_cv.notify_all();
        }
        Ok(())
    }

    fn completed_value(&self) -> FrameResult<u64> {
        Ok(*self.shared.completed.lock())
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> FrameResult<bool> {
        MockGpu::log(&self.shared, Event::Wait(value));
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut completed = self.shared.completed.lock();
        while *completed < value {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .completed_cv
                        .wait_until(&mut completed, deadline)
                        .timed_out()
                    {
                        return Ok(*completed >= value);
                    }
                }
                None => self.shared.completed_cv.wait(&mut completed),
            }
        }
        Ok(true)
    }
}

pub(crate) struct MockSwapchain {
    shared: Arc<Shared>,
    image_count: usize,
    extent: Extent,
    generation: u32,
    rotation: Vec<usize>,
    position: usize,
}

impl MockSwapchain {
    /// Hand out images in this order instead of 0, 1, 2, ...
    pub fn with_rotation(mut self, rotation: Vec<usize>) -> Self {
        self.rotation = rotation;
        self.position = 0;
        self
    }
}

impl Swapchain for MockSwapchain {
    type Image = MockImage;

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn current_image_index(&mut self) -> FrameResult<usize> {
        if self.shared.out_of_date_next_acquire.swap(false, Ordering::SeqCst) {
            return Err(FrameError::OutOfDate);
        }
        if self.shared.stall_next_acquire.swap(false, Ordering::SeqCst) {
            return Err(FrameError::AcquireStall {
                timeout: Duration::from_millis(10),
            });
        }
        let index = self.rotation[self.position];
        MockGpu::log(&self.shared, Event::Acquire(index));
        Ok(index)
    }

    fn image(&self, index: usize) -> FrameResult<MockImage> {
        if index >= self.image_count {
            return Err(FrameError::Swapchain(format!("no image {}", index)));
        }
        Ok(MockImage {
            index,
            generation: self.generation,
        })
    }

    fn present(&mut self, mode: PresentMode) -> FrameResult<PresentOutcome> {
        MockGpu::log(&self.shared, Event::Present(mode));
        self.position = (self.position + 1) % self.rotation.len();
        if self.shared.stale_next_present.swap(false, Ordering::SeqCst) {
            return Ok(PresentOutcome::Stale);
        }
        Ok(PresentOutcome::Presented)
    }

    fn resize_images(&mut self, width: u32, height: u32) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Resize(width, height));
        self.extent = Extent::new(width, height);
        self.generation += 1;
        self.position = 0;
        Ok(())
    }
}

pub(crate) struct MockRecorder {
    shared: Arc<Shared>,
}

impl CommandRecorder<MockImage> for MockRecorder {
    fn reset(&mut self, slot: usize) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Reset(slot));
        Ok(())
    }

    fn transition(
        &mut self,
        slot: usize,
        _image: &MockImage,
        before: ImageState,
        after: ImageState,
    ) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Transition(slot, before, after));
        Ok(())
    }

    fn clear(&mut self, slot: usize, _image: &MockImage, _color: [f32; 4]) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Clear(slot));
        Ok(())
    }

    fn close(&mut self, slot: usize) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Close(slot));
        Ok(())
    }

    fn execute(&mut self, slot: usize, image: &MockImage) -> FrameResult<()> {
        MockGpu::log(&self.shared, Event::Execute(slot, *image));
        Ok(())
    }
}

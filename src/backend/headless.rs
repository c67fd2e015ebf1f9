// Headless backend
//
// A worker thread stands in for the GPU queue. Work is executed strictly in
// submission order; each executed command list costs `latency` of "GPU
// time", and fence signals land only after everything queued before them.
// No window or Vulkan driver is needed, so the presentation cycle can be
// driven in CI and from the `[headless]` config mode.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{FrameError, FrameResult};
use crate::frame::{
    CommandRecorder, Extent, GpuFence, ImageState, PresentMode, PresentOutcome, Presenter,
    PresenterOptions, Swapchain,
};

pub type HeadlessPresenter = Presenter<HeadlessFence, HeadlessSwapchain, HeadlessCommands>;

/// Handle onto one headless swap image. The generation changes whenever
/// the images are recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessImage {
    pub index: usize,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Transition(ImageState, ImageState),
    Clear([f32; 4]),
}

enum Op {
    Execute {
        slot: usize,
        image: HeadlessImage,
        commands: Vec<Command>,
    },
    Present(HeadlessImage),
    Signal(u64),
    Shutdown,
}

/// Counters kept by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeadlessStats {
    pub completed: u64,
    pub executed: u64,
    pub presented: u64,
    /// Lists that referenced images from an older generation
    pub stale_executions: u64,
    /// Lists that left their image outside the present state
    pub bad_transitions: u64,
    pub last_clear: Option<[f32; 4]>,
}

struct Shared {
    completed: Mutex<u64>,
    completed_cv: Condvar,
    generation: AtomicU32,
    executed: AtomicU64,
    presented: AtomicU64,
    stale_executions: AtomicU64,
    bad_transitions: AtomicU64,
    last_clear: Mutex<Option<[f32; 4]>>,
}

/// Owns the worker thread. Drop it after every presenter built on it.
pub struct HeadlessGpu {
    shared: Arc<Shared>,
    sender: Sender<Op>,
    worker: Option<JoinHandle<()>>,
}

impl HeadlessGpu {
    /// Spawn the worker. `latency` is the time each command list takes.
    pub fn new(latency: Duration) -> FrameResult<Self> {
        let shared = Arc::new(Shared {
            completed: Mutex::new(0),
            completed_cv: Condvar::new(),
            generation: AtomicU32::new(0),
            executed: AtomicU64::new(0),
            presented: AtomicU64::new(0),
            stale_executions: AtomicU64::new(0),
            bad_transitions: AtomicU64::new(0),
            last_clear: Mutex::new(None),
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("headless-gpu".into())
            .spawn(move || run_queue(receiver, worker_shared, latency))
            .map_err(|e| FrameError::Device(format!("failed to spawn headless GPU: {}", e)))?;

        log::info!("Headless GPU started ({:?} per frame)", latency);

        Ok(Self {
            shared,
            sender,
            worker: Some(worker),
        })
    }

    pub fn fence(&self) -> HeadlessFence {
        HeadlessFence {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
        }
    }

    pub fn swapchain(&self, image_count: usize, width: u32, height: u32) -> HeadlessSwapchain {
        HeadlessSwapchain {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
            image_count,
            extent: Extent::clamped(width, height),
            next: 0,
        }
    }

    pub fn commands(&self, slot_count: usize) -> HeadlessCommands {
        HeadlessCommands {
            sender: self.sender.clone(),
            lists: vec![Vec::new(); slot_count],
        }
    }

    /// Presenter with a swapchain of exactly `frames_in_flight` images.
    pub fn presenter(
        &self,
        width: u32,
        height: u32,
        options: PresenterOptions,
    ) -> FrameResult<HeadlessPresenter> {
        let slots = options.frames_in_flight;
        Presenter::new(
            self.fence(),
            self.swapchain(slots, width, height),
            self.commands(slots),
            options,
        )
    }

    pub fn stats(&self) -> HeadlessStats {
        HeadlessStats {
            completed: *self.shared.completed.lock(),
            executed: self.shared.executed.load(Ordering::SeqCst),
            presented: self.shared.presented.load(Ordering::SeqCst),
            stale_executions: self.shared.stale_executions.load(Ordering::SeqCst),
            bad_transitions: self.shared.bad_transitions.load(Ordering::SeqCst),
            last_clear: *self.shared.last_clear.lock(),
        }
    }
}

impl Drop for HeadlessGpu {
    fn drop(&mut self) {
        // Anything still queued runs before the shutdown marker
        let _ = self.sender.send(Op::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Headless GPU thread panicked");
            }
        }
        log::info!("Headless GPU stopped");
    }
}

fn run_queue(receiver: Receiver<Op>, shared: Arc<Shared>, latency: Duration) {
    while let Ok(op) = receiver.recv() {
        match op {
            Op::Execute {
                slot,
                image,
                commands,
            } => {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                if image.generation != shared.generation.load(Ordering::SeqCst) {
                    log::error!(
                        "Slot {} executed against image {} of generation {}",
                        slot,
                        image.index,
                        image.generation
                    );
                    shared.stale_executions.fetch_add(1, Ordering::SeqCst);
                }
                if !ends_presentable(&commands) {
                    log::error!("Slot {} left image {} outside the present state", slot, image.index);
                    shared.bad_transitions.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(color) = commands.iter().rev().find_map(|c| match c {
                    Command::Clear(color) => Some(*color),
                    _ => None,
                }) {
                    *shared.last_clear.lock() = Some(color);
                }
                shared.executed.fetch_add(1, Ordering::SeqCst);
            }
            Op::Present(image) => {
                log::trace!("Presented image {}", image.index);
                shared.presented.fetch_add(1, Ordering::SeqCst);
            }
            Op::Signal(value) => {
                let mut completed = shared.completed.lock();
                if value > *completed {
                    *completed = value;
                }
                shared.completed_cv.notify_all();
            }
            Op::Shutdown => break,
        }
    }
}

/// Transitions must chain and return the image to the present state.
fn ends_presentable(commands: &[Command]) -> bool {
    let mut state = ImageState::Present;
    for command in commands {
        if let Command::Transition(before, after) = *command {
            if before != state {
                return false;
            }
            state = after;
        }
    }
    state == ImageState::Present
}

fn send(sender: &Sender<Op>, op: Op) -> FrameResult<()> {
    sender
        .send(op)
        .map_err(|_| FrameError::Device("headless GPU is gone".into()))
}

pub struct HeadlessFence {
    shared: Arc<Shared>,
    sender: Sender<Op>,
}

impl GpuFence for HeadlessFence {
    fn signal(&mut self, value: u64) -> FrameResult<()> {
        send(&self.sender, Op::Signal(value))
    }

    fn completed_value(&self) -> FrameResult<u64> {
        Ok(*self.shared.completed.lock())
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> FrameResult<bool> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
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

/// Hands out images in strict rotation: 0, 1, ..., N-1, 0, ...
pub struct HeadlessSwapchain {
    shared: Arc<Shared>,
    sender: Sender<Op>,
    image_count: usize,
    extent: Extent,
    next: usize,
}

impl Swapchain for HeadlessSwapchain {
    type Image = HeadlessImage;

    fn image_count(&self) -> usize {
        self.image_count
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn current_image_index(&mut self) -> FrameResult<usize> {
        Ok(self.next)
    }

    fn image(&self, index: usize) -> FrameResult<HeadlessImage> {
        if index >= self.image_count {
            return Err(FrameError::Swapchain(format!(
                "image {} out of {}",
                index, self.image_count
            )));
        }
        Ok(HeadlessImage {
            index,
            generation: self.shared.generation.load(Ordering::SeqCst),
        })
    }

    fn present(&mut self, _mode: PresentMode) -> FrameResult<PresentOutcome> {
        let image = self.image(self.next)?;
        send(&self.sender, Op::Present(image))?;
        self.next = (self.next + 1) % self.image_count;
        Ok(PresentOutcome::Presented)
    }

    fn resize_images(&mut self, width: u32, height: u32) -> FrameResult<()> {
        self.extent = Extent::clamped(width, height);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.next = 0;
        Ok(())
    }
}

/// Records into plain vectors; `execute` ships a copy to the worker.
pub struct HeadlessCommands {
    sender: Sender<Op>,
    lists: Vec<Vec<Command>>,
}

impl HeadlessCommands {
    fn list(&mut self, slot: usize) -> FrameResult<&mut Vec<Command>> {
        let count = self.lists.len();
        self.lists
            .get_mut(slot)
            .ok_or(FrameError::SlotOutOfRange { index: slot, count })
    }
}

impl CommandRecorder<HeadlessImage> for HeadlessCommands {
    fn reset(&mut self, slot: usize) -> FrameResult<()> {
        self.list(slot)?.clear();
        Ok(())
    }

    fn transition(
        &mut self,
        slot: usize,
        _image: &HeadlessImage,
        before: ImageState,
        after: ImageState,
    ) -> FrameResult<()> {
        self.list(slot)?.push(Command::Transition(before, after));
        Ok(())
    }

    fn clear(&mut self, slot: usize, _image: &HeadlessImage, color: [f32; 4]) -> FrameResult<()> {
        self.list(slot)?.push(Command::Clear(color));
        Ok(())
    }

    fn close(&mut self, slot: usize) -> FrameResult<()> {
        self.list(slot)?;
        Ok(())
    }

    fn execute(&mut self, slot: usize, image: &HeadlessImage) -> FrameResult<()> {
        let commands = self.list(slot)?.clone();
        send(
            &self.sender,
            Op::Execute {
                slot,
                image: *image,
                commands,
            },
        )
    }
}

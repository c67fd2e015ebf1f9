// Backend module - frame core implementations
//
// Vulkan: timeline semaphore fence, surface swapchain, per-slot command pools.
// Headless: worker-thread queue with the same ordering guarantees.

pub mod commands;
pub mod device;
pub mod headless;
pub mod swapchain;
pub mod sync;

pub use commands::FrameCommands;
pub use device::VulkanDevice;
pub use headless::{HeadlessGpu, HeadlessPresenter, HeadlessStats};
pub use swapchain::{Surface, SwapImage, Swapchain};
pub use sync::TimelineFence;

use crate::frame::Presenter;

pub type VulkanPresenter = Presenter<TimelineFence, Swapchain, FrameCommands>;

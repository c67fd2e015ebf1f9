// Frame pacing for a multi-buffered swapchain: CPU/GPU lockstep over a
// monotonic fence, one allocator per frame slot, drain-and-rebuild on resize.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;

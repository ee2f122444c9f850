//! Detection cycle control
//!
//! The outer capture, extract, align, predict and emit loop, its state
//! machine, and cooperative shutdown.

mod r#loop;
mod shutdown;


pub use r#loop::{CycleConfig, DetectionLoop, DetectionLoopBuilder, LoopStats};
pub use shutdown::{shutdown_channel, ShutdownHandle, ShutdownSignal};

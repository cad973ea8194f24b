//! Capture Relay Library
//!
//! Real-time audio capture relay: a priority reader thread keeps the
//! device drained into a block ring while an arbitrarily slow consumer
//! fetches whole periods.

pub mod audio;
pub mod capture;
pub mod relay;

pub use audio::{CaptureFormat, SampleFormat, StatsReport};
pub use capture::{CaptureDevice, ReadError};
pub use relay::{FetchStatus, PriorityResult, Relay, RelayConfig, RelayError};

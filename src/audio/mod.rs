//! 音频核心模块
//!
//! 包含：
//! - Format: 采集格式和周期字节数
//! - Ring Buffer: 块环形缓冲区（Mutex + Condvar 交接）
//! - Timing: 周期时长换算
//! - Stats: 中继统计

pub mod format;
pub mod ring_buffer;
pub mod stats;
pub mod timing;

pub use format::{CaptureFormat, FormatError, SampleFormat};
pub use ring_buffer::BlockRing;
pub use stats::{RelayStats, StatsReport};

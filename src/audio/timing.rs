//! 周期时长换算
//!
//! 帧数 ↔ 时长，所有计算走纳秒整数，避免浮点误差累积

use std::time::Duration;

/// 一个周期（frames 帧）在 rate 采样率下的时长
#[inline]
pub fn period_duration(frames: usize, rate: u32) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frames as u64 * 1_000_000_000 / rate as u64)
}

/// 给定时长对应的帧数（向下取整，至少 1 帧）
#[inline]
pub fn frames_for_duration(duration: Duration, rate: u32) -> usize {
    let frames = duration.as_nanos() * rate as u128 / 1_000_000_000;
    (frames as usize).max(1)
}

//! 采集设备接口
//!
//! relay 对驱动只有两个要求：
//! - 阻塞读入一个周期的交织字节
//! - 数据丢失（xrun）之后重新准备设备
//!
//! 设备的打开、参数协商、关闭都由调用方负责

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;
pub mod scripted;
pub mod synthetic;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use alsa::{AlsaCapture, AlsaError};
pub use scripted::{ScriptFeed, ScriptedDevice};
pub use synthetic::{SyntheticConfig, SyntheticDevice};

/// 单次读取失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    /// 设备级 overrun：驱动缓冲区溢出，本周期数据不完整
    #[error("device overrun (data lost)")]
    DataLoss,
    /// 其他任何失败，设备句柄不再可用
    #[error("device read failed: {0}")]
    Fatal(String),
}

/// 阻塞式采集设备
///
/// 实现者在采集线程中被独占使用，因此只需要 `Send`
pub trait CaptureDevice: Send + 'static {
    /// 阻塞读入恰好 `frames` 帧到 `dest`
    ///
    /// `dest` 长度为一个块（`frames` × 每帧字节数）。返回实际读到的帧数。
    fn read_period(&mut self, dest: &mut [u8], frames: usize) -> Result<usize, ReadError>;

    /// 数据丢失后重新准备设备
    fn recover(&mut self) -> Result<(), ReadError>;
}

/// 检查目标缓冲区能否容纳 `frames` 帧
///
/// 块大小与每块帧数由调用方分别给出，不一致时作为致命错误上报，
/// 而不是在采集线程里 panic
pub fn check_period_fits(dest: &[u8], frames: usize, frame_bytes: usize) -> Result<(), ReadError> {
    match frames.checked_mul(frame_bytes) {
        Some(needed) if needed <= dest.len() => Ok(()),
        _ => Err(ReadError::Fatal(format!(
            "destination {} bytes shorter than {} frames of {} bytes",
            dest.len(),
            frames,
            frame_bytes
        ))),
    }
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn read_period(&mut self, dest: &mut [u8], frames: usize) -> Result<usize, ReadError> {
        (**self).read_period(dest, frames)
    }

    fn recover(&mut self) -> Result<(), ReadError> {
        (**self).recover()
    }
}

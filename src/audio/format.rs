//! 采集格式
//!
//! 只负责"一帧多少字节、一个周期多少字节"的计算，
//! 不做任何样本转换：relay 搬运的是设备给出的原始交织字节。

use std::fmt;
use std::str::FromStr;

/// 格式解析错误
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unknown sample format: {0}")]
    UnknownSampleFormat(String),
    #[error("invalid capture format: {0}")]
    Invalid(&'static str),
}

/// PCM 样本格式
///
/// 判别值与 ALSA `snd_pcm_format_t` 一致，可以直接传给驱动。
/// 24-bit 格式按 ALSA 约定占 4 字节（低 3 字节有效）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SampleFormat {
    S8 = 0,
    U8 = 1,
    S16Le = 2,
    S16Be = 3,
    U16Le = 4,
    U16Be = 5,
    S24Le = 6,
    S24Be = 7,
    U24Le = 8,
    U24Be = 9,
    S32Le = 10,
    S32Be = 11,
    U32Le = 12,
    U32Be = 13,
    FloatLe = 14,
    FloatBe = 15,
    Float64Le = 16,
    Float64Be = 17,
}

impl SampleFormat {
    /// 每样本的字节数
    #[inline]
    pub fn sample_size(self) -> usize {
        match self {
            Self::S8 | Self::U8 => 1,
            Self::S16Le | Self::S16Be | Self::U16Le | Self::U16Be => 2,
            Self::S24Le
            | Self::S24Be
            | Self::U24Le
            | Self::U24Be
            | Self::S32Le
            | Self::S32Be
            | Self::U32Le
            | Self::U32Be
            | Self::FloatLe
            | Self::FloatBe => 4,
            Self::Float64Le | Self::Float64Be => 8,
        }
    }

    /// CLI / 日志使用的短名
    pub fn name(self) -> &'static str {
        match self {
            Self::S8 => "s8",
            Self::U8 => "u8",
            Self::S16Le => "s16le",
            Self::S16Be => "s16be",
            Self::U16Le => "u16le",
            Self::U16Be => "u16be",
            Self::S24Le => "s24le",
            Self::S24Be => "s24be",
            Self::U24Le => "u24le",
            Self::U24Be => "u24be",
            Self::S32Le => "s32le",
            Self::S32Be => "s32be",
            Self::U32Le => "u32le",
            Self::U32Be => "u32be",
            Self::FloatLe => "f32le",
            Self::FloatBe => "f32be",
            Self::Float64Le => "f64le",
            Self::Float64Be => "f64be",
        }
    }

    const ALL: [SampleFormat; 18] = [
        Self::S8,
        Self::U8,
        Self::S16Le,
        Self::S16Be,
        Self::U16Le,
        Self::U16Be,
        Self::S24Le,
        Self::S24Be,
        Self::U24Le,
        Self::U24Be,
        Self::S32Le,
        Self::S32Be,
        Self::U32Le,
        Self::U32Be,
        Self::FloatLe,
        Self::FloatBe,
        Self::Float64Le,
        Self::Float64Be,
    ];
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        // ALSA 风格的别名：S16_LE / FLOAT_LE
        let normalized = lower
            .replace('_', "")
            .replace("float64", "f64")
            .replace("float", "f32");
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == normalized)
            .ok_or_else(|| FormatError::UnknownSampleFormat(s.to_string()))
    }
}

/// 采集格式（交织）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub channels: u16,
    pub rate: u32,
    pub sample_format: SampleFormat,
}

impl CaptureFormat {
    pub fn new(channels: u16, rate: u32, sample_format: SampleFormat) -> Result<Self, FormatError> {
        if channels == 0 {
            return Err(FormatError::Invalid("channel count must be non-zero"));
        }
        if rate == 0 {
            return Err(FormatError::Invalid("sample rate must be non-zero"));
        }
        Ok(Self {
            channels,
            rate,
            sample_format,
        })
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.sample_size() * self.channels as usize
    }

    /// 一个周期（= relay 的一个块）的字节数
    #[inline]
    pub fn period_bytes(&self, frames: usize) -> usize {
        self.bytes_per_frame() * frames
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch {}Hz {}", self.channels, self.rate, self.sample_format)
    }
}

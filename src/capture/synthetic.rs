//! 合成采集设备
//!
//! 按真实时钟节奏产出周期：第 n 个周期在 start + n × period 之后才返回，
//! 行为上接近一个以固定采样率工作的声卡。
//!
//! 每个周期的前 8 字节是小端序的周期序号，其余为字节斜坡，
//! 消费端据此可以检查顺序和丢块。
//!
//! 与真实驱动一样，读取方落后超过设备缓冲区（`buffer_periods` 个周期）时
//! 报告数据丢失，需要 `recover` 之后才能继续。

use std::thread;
use std::time::{Duration, Instant};

use super::{check_period_fits, CaptureDevice, ReadError};
use crate::audio::timing::period_duration;
use crate::audio::CaptureFormat;

/// 周期头部：序号占用的字节数
pub const SEQUENCE_BYTES: usize = 8;

/// 合成设备配置
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub format: CaptureFormat,
    /// 每周期帧数
    pub period_frames: usize,
    /// 设备缓冲区能容纳的周期数
    pub buffer_periods: u32,
    /// 每 N 个周期注入一次数据丢失
    pub xrun_every: Option<u64>,
    /// 第 N 个周期之后报告致命错误
    pub fail_after: Option<u64>,
}

impl SyntheticConfig {
    pub fn new(format: CaptureFormat, period_frames: usize) -> Self {
        Self {
            format,
            period_frames,
            // 与 ALSA 设备默认一致：缓冲区 = 5 个周期
            buffer_periods: 5,
            xrun_every: None,
            fail_after: None,
        }
    }

    /// 一个周期的字节数
    pub fn period_bytes(&self) -> usize {
        self.format.period_bytes(self.period_frames)
    }

    pub fn period(&self) -> Duration {
        period_duration(self.period_frames, self.format.rate)
    }
}

/// 合成采集设备
pub struct SyntheticDevice {
    config: SyntheticConfig,
    period: Duration,
    /// 当前时钟起点（recover 时重置）
    epoch: Instant,
    /// 自 epoch 以来已交付的周期数
    delivered_since_epoch: u32,
    /// 全局周期序号
    sequence: u64,
    needs_recover: bool,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        let period = config.period();
        Self {
            config,
            period,
            epoch: Instant::now(),
            delivered_since_epoch: 0,
            sequence: 0,
            needs_recover: false,
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// 已产出的周期数（含丢失的）
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn fill(dest: &mut [u8], sequence: u64) {
        let seq = sequence.to_le_bytes();
        let header = dest.len().min(SEQUENCE_BYTES);
        dest[..header].copy_from_slice(&seq[..header]);
        for (i, byte) in dest[header..].iter_mut().enumerate() {
            *byte = (sequence as usize).wrapping_add(i) as u8;
        }
    }
}

/// 读出周期头部的序号
pub fn sequence_of(block: &[u8]) -> Option<u64> {
    let bytes: [u8; SEQUENCE_BYTES] = block.get(..SEQUENCE_BYTES)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl CaptureDevice for SyntheticDevice {
    fn read_period(&mut self, dest: &mut [u8], frames: usize) -> Result<usize, ReadError> {
        check_period_fits(dest, frames, self.config.format.bytes_per_frame())?;
        if self.needs_recover {
            return Err(ReadError::Fatal("read on unprepared device".to_string()));
        }
        if let Some(limit) = self.config.fail_after {
            if self.sequence >= limit {
                return Err(ReadError::Fatal(format!(
                    "synthetic failure after {} periods",
                    limit
                )));
            }
        }

        let due = self.epoch + self.period * (self.delivered_since_epoch + 1);
        let now = Instant::now();
        if now > due {
            // 读取方落后太多，设备缓冲区已被覆盖
            let behind = now.duration_since(due);
            if behind > self.period * self.config.buffer_periods {
                self.sequence += u64::from(self.config.buffer_periods);
                self.needs_recover = true;
                return Err(ReadError::DataLoss);
            }
        } else {
            thread::sleep(due - now);
        }

        let sequence = self.sequence;
        self.sequence += 1;
        self.delivered_since_epoch += 1;

        if let Some(every) = self.config.xrun_every {
            if every > 0 && self.sequence % every == 0 {
                self.needs_recover = true;
                return Err(ReadError::DataLoss);
            }
        }

        Self::fill(dest, sequence);
        Ok(frames)
    }

    fn recover(&mut self) -> Result<(), ReadError> {
        self.epoch = Instant::now();
        self.delivered_since_epoch = 0;
        self.needs_recover = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleFormat;

    fn config() -> SyntheticConfig {
        // 8 帧 @ 8kHz = 1ms 周期
        let format = CaptureFormat::new(2, 8000, SampleFormat::S16Le).unwrap();
        let mut config = SyntheticConfig::new(format, 8);
        // 测试线程可能被调度器延迟，放宽设备缓冲
        config.buffer_periods = 1000;
        config
    }

    #[test]
    fn test_sequence_header() {
        let config = config();
        let mut device = SyntheticDevice::new(config.clone());
        let mut buf = vec![0u8; config.period_bytes()];

        for expected in 0..3u64 {
            device.read_period(&mut buf, 8).unwrap();
            assert_eq!(sequence_of(&buf), Some(expected));
        }
    }

    #[test]
    fn test_paced_by_period() {
        let config = config();
        let mut device = SyntheticDevice::new(config.clone());
        let mut buf = vec![0u8; config.period_bytes()];

        let start = Instant::now();
        for _ in 0..10 {
            device.read_period(&mut buf, 8).unwrap();
        }
        // 10 个 1ms 周期（时钟起点略早于 start）
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn test_injected_xrun_requires_recover() {
        let mut config = config();
        config.xrun_every = Some(3);
        let mut device = SyntheticDevice::new(config.clone());
        let mut buf = vec![0u8; config.period_bytes()];

        assert!(device.read_period(&mut buf, 8).is_ok());
        assert!(device.read_period(&mut buf, 8).is_ok());
        assert_eq!(device.read_period(&mut buf, 8), Err(ReadError::DataLoss));
        assert!(matches!(
            device.read_period(&mut buf, 8),
            Err(ReadError::Fatal(_))
        ));

        device.recover().unwrap();
        device.read_period(&mut buf, 8).unwrap();
        assert_eq!(sequence_of(&buf), Some(3));
    }

    #[test]
    fn test_late_reader_loses_data() {
        let mut config = config();
        config.buffer_periods = 5;
        let mut device = SyntheticDevice::new(config.clone());
        let mut buf = vec![0u8; config.period_bytes()];

        // 远超 5 个周期的停顿
        thread::sleep(Duration::from_millis(50));
        assert_eq!(device.read_period(&mut buf, 8), Err(ReadError::DataLoss));
    }

    #[test]
    fn test_fail_after() {
        let mut config = config();
        config.fail_after = Some(1);
        let mut device = SyntheticDevice::new(config.clone());
        let mut buf = vec![0u8; config.period_bytes()];

        assert!(device.read_period(&mut buf, 8).is_ok());
        assert!(matches!(
            device.read_period(&mut buf, 8),
            Err(ReadError::Fatal(_))
        ));
    }
}

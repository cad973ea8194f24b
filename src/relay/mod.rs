//! 实时采集中继
//!
//! 把"必须准时读设备"和"什么时候来取都行"拆到两个线程：
//! - 采集线程以实时优先级阻塞读设备，一次一个周期，写入块环形缓冲区
//! - 任意优先级的消费者通过 `fetch` 取走完整的块，晚来只会丢旧块，不会拖住设备
//!
//! 对外只有三个操作：`start` / `fetch` / `stop`

mod priority;
mod worker;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::ring_buffer::{BlockRing, ReadSlot, RingError};
use crate::audio::{RelayStats, StatsReport};
use crate::capture::CaptureDevice;

pub use priority::{set_realtime_priority, PriorityResult};

/// Relay 配置
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// 环中的块数（至少 2；最多同时积压 block_count - 1 块）
    pub block_count: usize,
    /// 采集线程是否尝试切换到实时调度
    pub realtime: bool,
    /// 是否 mlock 块存储
    pub lock_memory: bool,
    /// 采集线程名
    pub thread_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            block_count: 8,
            realtime: true,
            lock_memory: false,
            thread_name: "capture-relay".to_string(),
        }
    }
}

/// 启动失败
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Storage(#[from] RingError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// `fetch` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// 目标缓冲区的前 block_size 字节是下一个块
    Ok,
    /// 消费者落后或设备丢数据，积压的旧块已被跳过；没有拷贝数据，立即再取即可
    Overrun,
    /// 采集已因致命错误停止（或调用方传入的缓冲区太短）；没有拷贝数据
    Error,
}

/// 采集中继句柄
///
/// 持有采集线程和块存储。`stop` 或 drop 时停止线程并释放存储
pub struct Relay<D: CaptureDevice> {
    ring: Arc<BlockRing>,
    stats: Arc<RelayStats>,
    worker: Option<JoinHandle<D>>,
    frames_per_block: usize,
}

impl<D: CaptureDevice> Relay<D> {
    /// 以默认配置启动，指定块数
    pub fn start(
        device: D,
        block_size: usize,
        frames_per_block: usize,
        block_count: usize,
    ) -> Result<Self, RelayError> {
        let config = RelayConfig {
            block_count,
            ..RelayConfig::default()
        };
        Self::start_with_config(device, block_size, frames_per_block, config)
    }

    /// 分配块存储并启动采集线程
    ///
    /// `block_size` 必须恰好是 `frames_per_block` 帧的字节数。
    /// 失败时已分配的资源全部释放，设备随之 drop
    pub fn start_with_config(
        device: D,
        block_size: usize,
        frames_per_block: usize,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        if block_size == 0 {
            return Err(RelayError::InvalidConfig("block size must be non-zero"));
        }
        if frames_per_block == 0 {
            return Err(RelayError::InvalidConfig("frames per block must be non-zero"));
        }
        if config.block_count < 2 {
            return Err(RelayError::InvalidConfig("block count must be at least 2"));
        }
        if config.thread_name.contains('\0') {
            return Err(RelayError::InvalidConfig("thread name contains a NUL byte"));
        }

        let ring = Arc::new(BlockRing::new(block_size, config.block_count)?);
        if config.lock_memory {
            ring.lock_memory();
        }
        let stats = Arc::new(RelayStats::new());

        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn({
                let ring = Arc::clone(&ring);
                let stats = Arc::clone(&stats);
                let realtime = config.realtime;
                move || worker::run(device, ring, stats, frames_per_block, realtime)
            })
            .map_err(RelayError::Spawn)?;

        log::info!(
            "Relay started: {} blocks x {} bytes ({} frames/block)",
            config.block_count,
            block_size,
            frames_per_block
        );

        Ok(Self {
            ring,
            stats,
            worker: Some(worker),
            frames_per_block,
        })
    }

    /// 取下一个块
    ///
    /// 没有数据时挂起等待（不自旋）。`dest` 至少 block_size 字节；
    /// 太短属于调用方违约，立即返回 `Error` 且不改变缓冲区状态。
    /// 数据拷贝在锁外进行。
    pub fn fetch(&mut self, dest: &mut [u8]) -> FetchStatus {
        let block_size = self.ring.block_size();
        if dest.len() < block_size {
            log::error!(
                "Fetch destination too short: {} bytes, block is {} bytes",
                dest.len(),
                block_size
            );
            return FetchStatus::Error;
        }

        match self.ring.acquire_read() {
            ReadSlot::Ready(offset) => {
                // acquire_read 之后 tail 块只属于消费者，直到 release_read
                let block = unsafe { self.ring.block(offset) };
                dest[..block_size].copy_from_slice(block);
                self.ring.release_read(offset);
                self.stats.record_delivered();
                FetchStatus::Ok
            }
            ReadSlot::Overrun => {
                self.stats.record_overrun_reported();
                FetchStatus::Overrun
            }
            ReadSlot::Error => FetchStatus::Error,
        }
    }

    /// 停止采集线程并释放存储，交还设备
    ///
    /// 如果采集线程正阻塞在驱动读中，等待这次读返回（最多一个周期）。
    /// 采集线程 panic 时返回 None
    pub fn stop(mut self) -> Option<D> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<D> {
        let worker = self.worker.take()?;
        self.ring.request_stop();

        match worker.join() {
            Ok(device) => {
                let report = self.stats();
                log::info!(
                    "Relay stopped: {} blocks captured, {} delivered, {} overruns",
                    report.blocks_captured,
                    report.blocks_delivered,
                    report.overruns_reported
                );
                Some(device)
            }
            Err(_) => {
                log::error!("Capture worker panicked");
                None
            }
        }
    }

    /// 每块字节数
    pub fn block_size(&self) -> usize {
        self.ring.block_size()
    }

    pub fn block_count(&self) -> usize {
        self.ring.block_count()
    }

    pub fn frames_per_block(&self) -> usize {
        self.frames_per_block
    }

    /// 采集线程仍在运行（未停止、未出错）
    pub fn is_running(&self) -> bool {
        let snapshot = self.ring.snapshot();
        self.worker.is_some() && !snapshot.stop && !snapshot.error
    }

    /// 锁存的致命错误描述
    pub fn fault(&self) -> Option<String> {
        self.ring.fault()
    }

    /// 已发布、尚未取走的块数
    pub fn pending_blocks(&self) -> usize {
        self.ring.pending_blocks()
    }

    pub fn is_memory_locked(&self) -> bool {
        self.ring.is_memory_locked()
    }

    pub fn stats(&self) -> StatsReport {
        self.stats
            .report(self.ring.block_size(), self.ring.block_count())
    }
}

impl<D: CaptureDevice> Drop for Relay<D> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedDevice;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(block_count: usize) -> RelayConfig {
        RelayConfig {
            block_count,
            realtime: false,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.block_count, 8);
        assert!(config.realtime);
        assert!(!config.lock_memory);
        assert_eq!(config.thread_name, "capture-relay");
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let (device, _feed) = ScriptedDevice::new();
        assert!(matches!(
            Relay::start_with_config(device, 16, 4, config(1)),
            Err(RelayError::InvalidConfig(_))
        ));

        let (device, _feed) = ScriptedDevice::new();
        assert!(matches!(
            Relay::start_with_config(device, 0, 4, config(4)),
            Err(RelayError::InvalidConfig(_))
        ));

        let (device, _feed) = ScriptedDevice::new();
        assert!(matches!(
            Relay::start_with_config(device, 16, 0, config(4)),
            Err(RelayError::InvalidConfig(_))
        ));

        let (device, _feed) = ScriptedDevice::new();
        let named = RelayConfig {
            thread_name: "capture\0relay".to_string(),
            ..config(4)
        };
        assert!(matches!(
            Relay::start_with_config(device, 16, 4, named),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_start_reports_oversized_storage() {
        let (device, _feed) = ScriptedDevice::new();
        assert!(matches!(
            Relay::start_with_config(device, usize::MAX / 2, 1, config(4)),
            Err(RelayError::Storage(RingError::TooLarge { .. }))
        ));
    }

    #[test]
    fn test_short_destination_leaves_state_untouched() {
        let (device, feed) = ScriptedDevice::new();
        let mut relay = Relay::start_with_config(device, 8, 2, config(4)).unwrap();
        feed.push_block(vec![3u8; 8]);
        assert!(feed.wait_for_reads(2, TIMEOUT));

        let mut short = [0u8; 4];
        assert_eq!(relay.fetch(&mut short), FetchStatus::Error);
        assert_eq!(relay.pending_blocks(), 1);
        assert!(relay.fault().is_none());

        let mut buf = [0u8; 8];
        assert_eq!(relay.fetch(&mut buf), FetchStatus::Ok);
        assert_eq!(buf, [3u8; 8]);

        // 先关闭脚本，采集线程才能从阻塞读中返回
        drop(feed);
        assert!(relay.stop().is_some());
    }

    #[test]
    fn test_stop_releases_storage_and_returns_device() {
        let (device, feed) = ScriptedDevice::new();
        let relay = Relay::start_with_config(device, 8, 2, config(4)).unwrap();
        let storage = Arc::downgrade(&relay.ring);

        feed.close();
        assert!(relay.stop().is_some());
        assert!(storage.upgrade().is_none());
    }

    #[test]
    fn test_drop_joins_worker() {
        let (device, feed) = ScriptedDevice::new();
        let relay = Relay::start_with_config(device, 8, 2, config(4)).unwrap();
        let storage = Arc::downgrade(&relay.ring);

        drop(feed);
        drop(relay);
        assert!(storage.upgrade().is_none());
    }

    #[test]
    fn test_is_running_tracks_fault() {
        let (device, feed) = ScriptedDevice::new();
        let mut relay = Relay::start_with_config(device, 8, 2, config(4)).unwrap();
        assert!(relay.is_running());

        feed.push_fatal("unplugged");
        let mut buf = [0u8; 8];
        assert_eq!(relay.fetch(&mut buf), FetchStatus::Error);
        assert!(!relay.is_running());
        assert_eq!(relay.fault().as_deref(), Some("unplugged"));
    }

    #[test]
    fn test_lock_memory_is_best_effort() {
        let (device, feed) = ScriptedDevice::new();
        let config = RelayConfig {
            lock_memory: true,
            ..config(4)
        };
        // RLIMIT_MEMLOCK 可能不允许；两种结果都可以
        let relay = Relay::start_with_config(device, 64, 16, config).unwrap();
        let _ = relay.is_memory_locked();
        feed.close();
        assert!(relay.stop().is_some());
    }
}

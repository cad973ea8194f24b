//! 采集线程
//!
//! 循环：申请 head 块 → 锁外阻塞读一个周期 → 锁内提交。
//! 持锁区间只有偏移量记账，驱动读永远不在锁内，
//! 因此慢消费者不会拖住设备 IO。

use std::sync::Arc;
use std::thread;

use super::priority;
use crate::audio::ring_buffer::{BlockRing, Commit};
use crate::audio::RelayStats;
use crate::capture::{CaptureDevice, ReadError};

/// 采集线程 unwind 时锁存错误，唤醒等待中的消费者
///
/// 只在 panic = "unwind" 的构建（dev / test）中生效。
/// release profile 使用 panic = "abort"，设备 panic 会直接终止进程
struct FaultOnUnwind<'a>(&'a BlockRing);

impl Drop for FaultOnUnwind<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.latch_error("capture worker panicked".to_string());
        }
    }
}

/// 采集线程主函数
///
/// 返回设备，交还给 `Relay::stop` 的调用方关闭
pub(crate) fn run<D: CaptureDevice>(
    mut device: D,
    ring: Arc<BlockRing>,
    stats: Arc<RelayStats>,
    frames_per_block: usize,
    realtime: bool,
) -> D {
    let _guard = FaultOnUnwind(&ring);

    priority::elevate_capture_thread(realtime);

    log::info!(
        "Capture worker started: {} blocks x {} bytes, {} frames/block",
        ring.block_count(),
        ring.block_size(),
        frames_per_block
    );

    while let Some(slot) = ring.begin_write() {
        if slot.ring_full {
            stats.record_ring_full();
            log::warn!("Relay ring full, dropping captured blocks until the consumer catches up");
        }

        // begin_write 之后 head 块只属于本线程
        let block = unsafe { ring.block_mut(slot.offset) };

        match device.read_period(block, frames_per_block) {
            Ok(_) => match ring.commit_write(slot) {
                Commit::Published => stats.record_captured(),
                Commit::Dropped => stats.record_dropped(),
            },
            Err(ReadError::DataLoss) => {
                // 不完整的块不发布
                stats.record_device_overrun();
                ring.mark_data_loss();
                log::warn!("Realtime capture overrun");

                if let Err(e) = device.recover() {
                    log::error!("Capture device recovery failed: {}", e);
                    ring.latch_error(e.to_string());
                }
            }
            Err(ReadError::Fatal(reason)) => {
                log::error!("Capture device read failed: {}", reason);
                ring.latch_error(reason);
            }
        }
    }

    log::info!("Capture worker finished");
    device
}

//! Relay 统计模块
//!
//! 采集线程和消费线程各自累加计数，全部是 Relaxed 原子操作，
//! 不进锁，也不影响环形缓冲区的时序

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Relay 统计收集器
///
/// 生产者写的计数和消费者写的计数分在不同 cache line 上
#[derive(Default)]
pub struct RelayStats {
    // 采集线程写
    blocks_captured: CachePadded<AtomicU64>,
    blocks_dropped: CachePadded<AtomicU64>,
    ring_full_events: CachePadded<AtomicU64>,
    device_overruns: CachePadded<AtomicU64>,

    // 消费线程写
    blocks_delivered: CachePadded<AtomicU64>,
    overruns_reported: CachePadded<AtomicU64>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一个完整的块已发布到环形缓冲区
    #[inline]
    pub fn record_captured(&self) {
        self.blocks_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// 读完但因 overrun 未发布而丢弃的块
    #[inline]
    pub fn record_dropped(&self) {
        self.blocks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 写指针追上读指针（消费者太慢）
    #[inline]
    pub fn record_ring_full(&self) {
        self.ring_full_events.fetch_add(1, Ordering::Relaxed);
    }

    /// 驱动报告的数据丢失（xrun）
    #[inline]
    pub fn record_device_overrun(&self) {
        self.device_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delivered(&self) {
        self.blocks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// fetch 向调用方返回了一次 Overrun
    #[inline]
    pub fn record_overrun_reported(&self) {
        self.overruns_reported.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn blocks_captured(&self) -> u64 {
        self.blocks_captured.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn blocks_delivered(&self) -> u64 {
        self.blocks_delivered.load(Ordering::Relaxed)
    }

    /// 生成快照
    pub fn report(&self, block_size: usize, block_count: usize) -> StatsReport {
        StatsReport {
            block_size,
            block_count,
            blocks_captured: self.blocks_captured.load(Ordering::Relaxed),
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            ring_full_events: self.ring_full_events.load(Ordering::Relaxed),
            device_overruns: self.device_overruns.load(Ordering::Relaxed),
            overruns_reported: self.overruns_reported.load(Ordering::Relaxed),
        }
    }
}

/// 统计报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub block_size: usize,
    pub block_count: usize,
    pub blocks_captured: u64,
    pub blocks_delivered: u64,
    pub blocks_dropped: u64,
    pub ring_full_events: u64,
    pub device_overruns: u64,
    pub overruns_reported: u64,
}

impl StatsReport {
    /// 已发布但尚未被消费（或被 overrun 跳过）的块数
    pub fn blocks_skipped(&self) -> u64 {
        self.blocks_captured.saturating_sub(self.blocks_delivered)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relay Statistics")?;
        writeln!(f, "================")?;
        writeln!(
            f,
            "Ring: {} blocks x {} bytes ({} bytes)",
            self.block_count,
            self.block_size,
            self.block_count * self.block_size
        )?;
        writeln!(f)?;

        writeln!(f, "Blocks captured:  {}", self.blocks_captured)?;
        writeln!(f, "Blocks delivered: {}", self.blocks_delivered)?;
        writeln!(f, "Blocks skipped:   {}", self.blocks_skipped())?;
        writeln!(f, "Blocks dropped:   {}", self.blocks_dropped)?;
        writeln!(f)?;

        writeln!(f, "Overruns:")?;
        writeln!(f, "  Ring full:       {}", self.ring_full_events)?;
        writeln!(f, "  Device (xrun):   {}", self.device_overruns)?;
        writeln!(f, "  Reported:        {}", self.overruns_reported)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = RelayStats::new();
        stats.record_captured();
        stats.record_captured();
        stats.record_captured();
        stats.record_delivered();
        stats.record_dropped();
        stats.record_device_overrun();
        stats.record_overrun_reported();

        let report = stats.report(4096, 4);
        assert_eq!(report.blocks_captured, 3);
        assert_eq!(report.blocks_delivered, 1);
        assert_eq!(report.blocks_skipped(), 2);
        assert_eq!(report.blocks_dropped, 1);
        assert_eq!(report.device_overruns, 1);
        assert_eq!(report.overruns_reported, 1);
        assert_eq!(report.ring_full_events, 0);
    }

    #[test]
    fn test_report_display() {
        let stats = RelayStats::new();
        stats.record_ring_full();
        let text = stats.report(4096, 4).to_string();
        assert!(text.contains("4 blocks x 4096 bytes (16384 bytes)"));
        assert!(text.contains("Ring full:       1"));
    }
}

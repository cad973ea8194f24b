//! 块环形缓冲区
//!
//! 固定数量、固定大小（= 设备一个周期）的字节块，组成一个环。
//! 与播放器里的 lock-free SPSC 缓冲不同，这里用一把 Mutex + 一个 Condvar：
//! - 消费者可以在 Condvar 上真正挂起等待，而不是自旋
//! - 锁内只做偏移量记账（O(1)），驱动读和数据拷贝都在锁外进行
//!
//! 块存储本身不在锁内。采集线程只写 head 块，消费者只读 tail 块，
//! 两者在任意时刻都不重叠：
//! - head == tail 表示空，消费者不会去读
//! - 写指针的下一个位置等于读指针时判定为 overrun，之后读到的块被丢弃，
//!   head 永远不会从非空一侧追上 tail
//! - 消费者在拷贝完成后才释放（推进）tail，拷贝中的块仍算作占用

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// 缓冲区创建错误
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("invalid ring geometry: {block_size} bytes x {block_count} blocks (need non-zero blocks and at least 2 of them)")]
    InvalidGeometry { block_size: usize, block_count: usize },
    #[error("ring size overflows: {block_size} bytes x {block_count} blocks")]
    TooLarge { block_size: usize, block_count: usize },
    #[error("failed to allocate {bytes} bytes of block storage")]
    Allocation { bytes: usize },
}

/// 锁保护的共享状态
#[derive(Debug, Default)]
struct RingState {
    /// 采集线程下一个要写的块
    head_offset: usize,
    /// 消费者下一个要读的块
    tail_offset: usize,
    overrun: bool,
    error: bool,
    stop: bool,
    /// 致命错误的描述（error 置位时同时写入）
    fault: Option<String>,
}

/// 采集线程申请到的写入位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSlot {
    /// 本次写入的块偏移
    pub offset: usize,
    /// 发布后 head 将前进到的位置
    pub next: usize,
    /// 本次申请时首次检测到缓冲区已满
    pub ring_full: bool,
}

/// 写入提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// 块已发布，消费者可见
    Published,
    /// overrun 未清除，块被丢弃
    Dropped,
}

/// 消费者等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSlot {
    /// tail 处有一个完整的块可读，读完后需调用 `release_read`
    Ready(usize),
    /// 已跳过所有积压的旧块
    Overrun,
    /// 采集线程已因致命错误退出
    Error,
}

/// 状态快照（用于观测和测试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub head_offset: usize,
    pub tail_offset: usize,
    pub overrun: bool,
    pub error: bool,
    pub stop: bool,
}

/// 块环形缓冲区
pub struct BlockRing {
    state: Mutex<RingState>,
    cond: Condvar,
    storage: Box<[UnsafeCell<u8>]>,
    block_size: usize,
    block_count: usize,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

// storage 的并发访问由 head/tail 协议保证不重叠
unsafe impl Sync for BlockRing {}

impl BlockRing {
    /// 分配 block_size × block_count 字节的存储
    ///
    /// 分配失败时返回错误而不是 abort
    pub fn new(block_size: usize, block_count: usize) -> Result<Self, RingError> {
        if block_size == 0 || block_count < 2 {
            return Err(RingError::InvalidGeometry {
                block_size,
                block_count,
            });
        }

        let bytes = block_size
            .checked_mul(block_count)
            .ok_or(RingError::TooLarge {
                block_size,
                block_count,
            })?;

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| RingError::Allocation { bytes })?;
        storage.resize_with(bytes, || UnsafeCell::new(0));

        Ok(Self {
            state: Mutex::new(RingState::default()),
            cond: Condvar::new(),
            storage: storage.into_boxed_slice(),
            block_size,
            block_count,
            memory_locked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// 存储总字节数
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.head_offset == state.tail_offset
    }

    /// offset 之后的下一个块（环绕）
    #[inline]
    pub fn next_offset(&self, offset: usize) -> usize {
        let next = offset + self.block_size;
        if next >= self.len() {
            0
        } else {
            next
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        // 持锁区间只有记账，不会在中途 panic；即使中毒也继续使用
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // 生产者（采集线程）
    // =========================================================================

    /// 申请下一个写入位置
    ///
    /// stop 已置位时返回 None。写指针的下一个位置等于读指针时置 overrun：
    /// 本次读到的块将被丢弃，而不是覆盖未读数据。
    pub fn begin_write(&self) -> Option<WriteSlot> {
        let mut state = self.lock();
        if state.stop {
            return None;
        }

        let offset = state.head_offset;
        let next = self.next_offset(offset);
        let mut ring_full = false;
        if next == state.tail_offset {
            ring_full = !state.overrun;
            state.overrun = true;
        }

        Some(WriteSlot {
            offset,
            next,
            ring_full,
        })
    }

    /// 发布已写满的块
    ///
    /// overrun 未被消费者清除时丢弃本块（head 不前进）。
    /// 缓冲区由空变非空时唤醒等待中的消费者。
    pub fn commit_write(&self, slot: WriteSlot) -> Commit {
        let mut state = self.lock();
        if state.overrun {
            return Commit::Dropped;
        }

        debug_assert_eq!(state.head_offset, slot.offset);
        if state.head_offset == state.tail_offset {
            self.cond.notify_one();
        }
        state.head_offset = slot.next;
        Commit::Published
    }

    /// 驱动报告数据丢失：置 overrun 并唤醒消费者
    ///
    /// head 不前进，本次不完整的块被丢弃
    pub fn mark_data_loss(&self) {
        let mut state = self.lock();
        state.overrun = true;
        self.cond.notify_one();
    }

    /// 锁存致命错误
    ///
    /// error 一旦置位不再清除，同时置 stop 让采集线程退出
    pub fn latch_error(&self, reason: String) {
        let mut state = self.lock();
        if !state.error {
            state.fault = Some(reason);
        }
        state.error = true;
        state.stop = true;
        self.cond.notify_all();
    }

    /// 请求采集线程退出（下一次循环开始时生效）
    pub fn request_stop(&self) {
        let mut state = self.lock();
        state.stop = true;
    }

    /// 采集线程可写入的块
    ///
    /// # Safety
    ///
    /// 只能由唯一的生产者对 `begin_write` 返回的 offset 调用，
    /// 且在 `commit_write` 之前使用完毕
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn block_mut(&self, offset: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.block_ptr(offset), self.block_size)
    }

    // =========================================================================
    // 消费者
    // =========================================================================

    /// 等待直到有块可读、发生 overrun 或出错
    ///
    /// Condvar 等待放在循环里，每次唤醒都重新检查条件（容忍虚假唤醒）
    pub fn acquire_read(&self) -> ReadSlot {
        let mut state = self.lock();
        while state.head_offset == state.tail_offset && !(state.overrun || state.error) {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.error {
            ReadSlot::Error
        } else if state.overrun {
            // 丢弃所有积压的旧块，从最新位置继续
            state.overrun = false;
            state.tail_offset = state.head_offset;
            ReadSlot::Overrun
        } else {
            ReadSlot::Ready(state.tail_offset)
        }
    }

    /// 拷贝完成后释放 tail 块
    pub fn release_read(&self, offset: usize) {
        let mut state = self.lock();
        debug_assert_eq!(state.tail_offset, offset);
        state.tail_offset = self.next_offset(offset);
    }

    /// 消费者可读取的块
    ///
    /// # Safety
    ///
    /// 只能由唯一的消费者对 `acquire_read` 返回的 offset 调用，
    /// 且在 `release_read` 之前使用完毕
    pub unsafe fn block(&self, offset: usize) -> &[u8] {
        std::slice::from_raw_parts(self.block_ptr(offset), self.block_size)
    }

    // =========================================================================
    // 观测
    // =========================================================================

    pub fn snapshot(&self) -> RingSnapshot {
        let state = self.lock();
        RingSnapshot {
            head_offset: state.head_offset,
            tail_offset: state.tail_offset,
            overrun: state.overrun,
            error: state.error,
            stop: state.stop,
        }
    }

    /// 已发布但未消费的块数
    pub fn pending_blocks(&self) -> usize {
        let state = self.lock();
        let used = if state.head_offset >= state.tail_offset {
            state.head_offset - state.tail_offset
        } else {
            self.len() - state.tail_offset + state.head_offset
        };
        used / self.block_size
    }

    /// 致命错误描述
    pub fn fault(&self) -> Option<String> {
        self.lock().fault.clone()
    }

    #[inline]
    fn block_ptr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset % self.block_size == 0 && offset < self.len(),
            "block offset {} out of range",
            offset
        );
        // UnsafeCell<u8> 与 u8 布局相同，指针来源覆盖整个 storage
        UnsafeCell::raw_get(unsafe { self.storage.as_ptr().add(offset) })
    }

    // =========================================================================
    // 内存锁定
    // =========================================================================

    /// 锁定块存储，防止被换页
    ///
    /// 实时线程直接向这块内存读入数据，page fault 会拉长读周期。
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true; // 已经锁定
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let len = self.len();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Block storage locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock block storage ({})",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁块存储
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.len());
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Block storage unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }
}

impl Drop for BlockRing {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 单线程模拟一次完整的"读入 + 发布"
    fn produce(ring: &BlockRing, fill: u8) -> Commit {
        let slot = ring.begin_write().expect("not stopped");
        unsafe { ring.block_mut(slot.offset) }.fill(fill);
        ring.commit_write(slot)
    }

    fn consume(ring: &BlockRing) -> Option<Vec<u8>> {
        match ring.acquire_read() {
            ReadSlot::Ready(offset) => {
                let data = unsafe { ring.block(offset) }.to_vec();
                ring.release_read(offset);
                Some(data)
            }
            _ => None,
        }
    }

    #[test]
    fn test_offsets_wrap() {
        let ring = BlockRing::new(16, 4).unwrap();
        assert_eq!(ring.len(), 64);
        assert_eq!(ring.next_offset(0), 16);
        assert_eq!(ring.next_offset(32), 48);
        assert_eq!(ring.next_offset(48), 0);
    }

    #[test]
    fn test_publish_then_read_in_order() {
        let ring = BlockRing::new(8, 4).unwrap();
        assert!(ring.is_empty());

        assert_eq!(produce(&ring, 1), Commit::Published);
        assert_eq!(produce(&ring, 2), Commit::Published);
        assert_eq!(ring.pending_blocks(), 2);

        assert_eq!(consume(&ring), Some(vec![1; 8]));
        assert_eq!(consume(&ring), Some(vec![2; 8]));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let ring = BlockRing::new(4, 3).unwrap();
        for round in 0..10u8 {
            assert_eq!(produce(&ring, round), Commit::Published);
            assert_eq!(consume(&ring), Some(vec![round; 4]));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.head_offset, snap.tail_offset);
        assert_eq!(snap.head_offset % 4, 0);
        assert!(snap.head_offset < 12);
    }

    #[test]
    fn test_full_ring_flags_overrun_instead_of_overwriting() {
        let ring = BlockRing::new(4, 4).unwrap();
        // 最多 block_count - 1 个待读块
        for i in 0..3 {
            assert_eq!(produce(&ring, i), Commit::Published);
        }
        assert_eq!(ring.pending_blocks(), 3);

        let slot = ring.begin_write().unwrap();
        assert!(slot.ring_full);
        assert_eq!(ring.commit_write(slot), Commit::Dropped);

        // 再来一次不会重复报告 ring_full
        let slot = ring.begin_write().unwrap();
        assert!(!slot.ring_full);
        assert_eq!(ring.commit_write(slot), Commit::Dropped);

        // 未读数据保持不变
        assert_eq!(ring.pending_blocks(), 3);
        assert!(ring.snapshot().overrun);
    }

    #[test]
    fn test_overrun_skips_to_latest() {
        let ring = BlockRing::new(4, 4).unwrap();
        for i in 0..3 {
            produce(&ring, i);
        }
        let slot = ring.begin_write().unwrap();
        ring.commit_write(slot);

        assert_eq!(ring.acquire_read(), ReadSlot::Overrun);
        let snap = ring.snapshot();
        assert!(!snap.overrun);
        assert_eq!(snap.tail_offset, snap.head_offset);

        // 恢复正常投递
        assert_eq!(produce(&ring, 9), Commit::Published);
        assert_eq!(consume(&ring), Some(vec![9; 4]));
    }

    #[test]
    fn test_data_loss_reported_once() {
        let ring = BlockRing::new(4, 4).unwrap();
        produce(&ring, 1);
        ring.mark_data_loss();

        assert_eq!(ring.acquire_read(), ReadSlot::Overrun);
        // 之后的块正常投递
        produce(&ring, 2);
        assert_eq!(consume(&ring), Some(vec![2; 4]));
    }

    #[test]
    fn test_error_is_permanent() {
        let ring = BlockRing::new(4, 4).unwrap();
        produce(&ring, 1);
        ring.latch_error("device gone".to_string());

        assert_eq!(ring.acquire_read(), ReadSlot::Error);
        assert_eq!(ring.acquire_read(), ReadSlot::Error);
        assert!(ring.begin_write().is_none());
        assert_eq!(ring.fault().as_deref(), Some("device gone"));

        // 只保留第一次的原因
        ring.latch_error("second".to_string());
        assert_eq!(ring.fault().as_deref(), Some("device gone"));
    }

    #[test]
    fn test_stop_ends_writes() {
        let ring = BlockRing::new(4, 2).unwrap();
        assert!(ring.begin_write().is_some());
        ring.request_stop();
        assert!(ring.begin_write().is_none());
        assert!(ring.snapshot().stop);
    }

    #[test]
    fn test_waiting_consumer_is_woken() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(BlockRing::new(4, 4).unwrap());
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || consume(&ring))
        };

        thread::sleep(std::time::Duration::from_millis(20));
        produce(&ring, 7);
        assert_eq!(consumer.join().unwrap(), Some(vec![7; 4]));
    }

    #[test]
    fn test_too_large_is_an_error() {
        assert!(matches!(
            BlockRing::new(usize::MAX, 2),
            Err(RingError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_invalid_geometry_is_an_error() {
        assert!(matches!(
            BlockRing::new(4, 1),
            Err(RingError::InvalidGeometry {
                block_size: 4,
                block_count: 1
            })
        ));
        assert!(matches!(
            BlockRing::new(0, 4),
            Err(RingError::InvalidGeometry { .. })
        ));
    }
}

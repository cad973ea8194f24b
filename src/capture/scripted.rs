//! 脚本驱动的测试设备
//!
//! 无需音频硬件，逐步决定每一次阻塞读的结果：
//! 一个数据块、一次数据丢失，或一个致命错误。
//! 脚本为空时读调用一直阻塞，直到有新的步骤或脚本被关闭，
//! 这与真实驱动"等到一个周期就绪"的行为一致。
//!
//! # Example
//!
//! ```
//! use capture_relay::capture::ScriptedDevice;
//!
//! let (device, feed) = ScriptedDevice::new();
//! feed.push_block(vec![1u8; 16]);
//! feed.push_data_loss();
//! feed.push_block(vec![2u8; 16]);
//! # drop(device);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{CaptureDevice, ReadError};

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 读到一块数据（超出目标长度的部分被截断，不足部分补零）
    Block(Vec<u8>),
    /// 设备级 overrun
    DataLoss,
    /// 不可恢复的失败
    Fatal(String),
    /// 读调用内部 panic（模拟有缺陷的驱动实现）
    Panic(String),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    closed: bool,
    reads_started: usize,
    recovers: usize,
    /// 下一次 recover 的失败原因
    recover_failure: Option<String>,
}

#[derive(Default)]
struct Shared {
    script: Mutex<Script>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 设备端，交给 relay
pub struct ScriptedDevice {
    shared: Arc<Shared>,
}

/// 控制端，留在测试里
///
/// drop 时关闭脚本，阻塞中的读调用以致命错误返回
pub struct ScriptFeed {
    shared: Arc<Shared>,
}

impl ScriptedDevice {
    pub fn new() -> (ScriptedDevice, ScriptFeed) {
        let shared = Arc::new(Shared::default());
        (
            ScriptedDevice {
                shared: Arc::clone(&shared),
            },
            ScriptFeed { shared },
        )
    }
}

impl CaptureDevice for ScriptedDevice {
    fn read_period(&mut self, dest: &mut [u8], frames: usize) -> Result<usize, ReadError> {
        let mut script = self.shared.lock();
        script.reads_started += 1;
        self.shared.cond.notify_all();

        let step = loop {
            if let Some(step) = script.steps.pop_front() {
                break step;
            }
            if script.closed {
                return Err(ReadError::Fatal("script closed".to_string()));
            }
            script = self
                .shared
                .cond
                .wait(script)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(script);

        match step {
            Step::Block(data) => {
                let n = data.len().min(dest.len());
                dest[..n].copy_from_slice(&data[..n]);
                dest[n..].fill(0);
                Ok(frames)
            }
            Step::DataLoss => Err(ReadError::DataLoss),
            Step::Fatal(reason) => Err(ReadError::Fatal(reason)),
            Step::Panic(message) => panic!("{}", message),
        }
    }

    fn recover(&mut self) -> Result<(), ReadError> {
        let mut script = self.shared.lock();
        script.recovers += 1;
        self.shared.cond.notify_all();
        match script.recover_failure.take() {
            Some(reason) => Err(ReadError::Fatal(reason)),
            None => Ok(()),
        }
    }
}

impl ScriptFeed {
    pub fn push(&self, step: Step) {
        let mut script = self.shared.lock();
        script.steps.push_back(step);
        self.shared.cond.notify_all();
    }

    pub fn push_block(&self, data: impl Into<Vec<u8>>) {
        self.push(Step::Block(data.into()));
    }

    pub fn push_data_loss(&self) {
        self.push(Step::DataLoss);
    }

    pub fn push_fatal(&self, reason: &str) {
        self.push(Step::Fatal(reason.to_string()));
    }

    pub fn push_panic(&self, message: &str) {
        self.push(Step::Panic(message.to_string()));
    }

    /// 让下一次 recover 以致命错误失败
    pub fn fail_next_recover(&self, reason: &str) {
        self.shared.lock().recover_failure = Some(reason.to_string());
    }

    /// 关闭脚本：剩余步骤仍会被读完，之后的读调用返回致命错误
    pub fn close(&self) {
        let mut script = self.shared.lock();
        script.closed = true;
        self.shared.cond.notify_all();
    }

    /// 设备已进入过的读调用次数
    pub fn reads_started(&self) -> usize {
        self.shared.lock().reads_started
    }

    pub fn recover_count(&self) -> usize {
        self.shared.lock().recovers
    }

    /// 尚未被读走的步骤数
    pub fn pending_steps(&self) -> usize {
        self.shared.lock().steps.len()
    }

    /// 等待设备进入第 n 次读调用
    ///
    /// 第 n 次读开始意味着前 n - 1 次读的结果已经被采集线程处理完毕。
    /// 超时返回 false
    pub fn wait_for_reads(&self, n: usize, timeout: Duration) -> bool {
        let script = self.shared.lock();
        let (script, _) = self
            .shared
            .cond
            .wait_timeout_while(script, timeout, |s| s.reads_started < n)
            .unwrap_or_else(PoisonError::into_inner);
        script.reads_started >= n
    }
}

impl Drop for ScriptFeed {
    fn drop(&mut self) {
        self.close();
    }
}

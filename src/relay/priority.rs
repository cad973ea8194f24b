//! 采集线程优先级
//!
//! 尽力而为：提升失败只记录警告，采集照常进行。
//! Unix 上使用 SCHED_FIFO + 该策略允许的最高优先级
//! （通常需要 CAP_SYS_NICE 或 rtprio 资源限制）。

use std::fmt;

/// 优先级提升结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    /// 已切换到实时调度
    Realtime { priority: i32 },
    /// 被系统拒绝（errno）
    Denied(i32),
    /// 当前平台不支持
    Unsupported,
    /// 配置中关闭了实时调度
    Disabled,
}

impl PriorityResult {
    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::Realtime { .. })
    }
}

impl fmt::Display for PriorityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realtime { priority } => write!(f, "SCHED_FIFO priority {}", priority),
            Self::Denied(errno) => write!(
                f,
                "denied ({})",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Self::Unsupported => write!(f, "unsupported on this platform"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// 将当前线程切换到实时调度
#[cfg(unix)]
pub fn set_realtime_priority() -> PriorityResult {
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if priority < 0 {
            return PriorityResult::Denied(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            );
        }

        // 部分平台的 sched_param 还有其他字段
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        // pthread_setschedparam 直接返回 errno，而不是设置 errno
        let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if result == 0 {
            PriorityResult::Realtime { priority }
        } else {
            PriorityResult::Denied(result)
        }
    }
}

#[cfg(not(unix))]
pub fn set_realtime_priority() -> PriorityResult {
    PriorityResult::Unsupported
}

/// 采集线程启动时调用一次
pub fn elevate_capture_thread(enabled: bool) -> PriorityResult {
    if !enabled {
        log::debug!("Realtime scheduling disabled by configuration");
        return PriorityResult::Disabled;
    }

    let result = set_realtime_priority();
    if result.is_realtime() {
        log::debug!("Capture thread priority set: {}", result);
    } else {
        log::warn!(
            "Failed to set realtime priority ({}), using default scheduling",
            result
        );
    }
    result
}

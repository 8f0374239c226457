//! 测试桩命名空间：集中提供节流测试常用的记录型实现。
//!
//! # 设计定位（Why）
//! - 节流场景的测试几乎都需要“记录每个周期的时长，并在记录时顺便改写压力源”，
//!   集中维护可避免各测试文件重复定义；
//! - 确定性定时器 [`ManualTimer`](crate::time::ManualTimer) 位于 `time` 模块，与生产定时器并列。
//!
//! # 风险与权衡（Trade-offs）
//! - 回调在节流循环内同步执行，只适合做常数量的簿记，不要在其中阻塞。

use std::fmt;

use parking_lot::Mutex;

use crate::metrics::MetricsSink;

type DelayHook = Box<dyn Fn(u32) + Send + Sync + 'static>;

/// 记录全部周期时长的指标出口，可选地在每次记录后执行回调。
#[derive(Default)]
pub struct RecordingMetricsSink {
    delays: Mutex<Vec<u32>>,
    hook: Option<DelayHook>,
}

impl RecordingMetricsSink {
    /// 仅记录、不回调。
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录后执行 `hook`，常用于模拟“每个周期之后压力发生变化”。
    pub fn with_hook(hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self {
            delays: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    /// 已记录时长的快照。
    pub fn delays(&self) -> Vec<u32> {
        self.delays.lock().clone()
    }

    /// 已记录的周期数。
    pub fn len(&self) -> usize {
        self.delays.lock().len()
    }

    /// 是否尚未记录任何周期。
    pub fn is_empty(&self) -> bool {
        self.delays.lock().is_empty()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn report_delay(&self, delay_millis: u32) {
        self.delays.lock().push(delay_millis);
        if let Some(hook) = &self.hook {
            hook(delay_millis);
        }
    }
}

impl fmt::Debug for RecordingMetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingMetricsSink")
            .field("delays", &*self.delays.lock())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

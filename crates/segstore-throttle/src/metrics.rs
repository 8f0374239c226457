//! 节流指标出口。
//!
//! 节流器在每个周期启动时调用一次 [`MetricsSink::report_delay`]，无论该周期之后自然到期还是被提前放弃。
//! 指标后端本身不在本 crate 范围内；这里只提供契约、空实现与基于 `tracing` 的结构化事件实现。

use tracing::trace;

/// 指标接收端。
///
/// # 契约说明（What）
/// - 实现必须廉价且不得阻塞：它在节流循环内被同步调用；
/// - `delay_millis` 为本周期实际登记的等待时长（已按上限截断）。
pub trait MetricsSink: Send + Sync + 'static {
    /// 记录一次周期等待时长。
    fn report_delay(&self, delay_millis: u32);
}

impl<F> MetricsSink for F
where
    F: Fn(u32) + Send + Sync + 'static,
{
    fn report_delay(&self, delay_millis: u32) {
        self(delay_millis)
    }
}

/// 丢弃所有指标的空实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn report_delay(&self, _delay_millis: u32) {}
}

/// 将周期时长以结构化 `tracing` 事件输出，由订阅端（日志、OTel 导出器等）转成指标。
#[derive(Clone, Copy, Debug)]
pub struct TracingMetricsSink {
    container_id: u32,
}

impl TracingMetricsSink {
    /// 绑定容器编号。
    pub const fn new(container_id: u32) -> Self {
        Self { container_id }
    }
}

impl MetricsSink for TracingMetricsSink {
    fn report_delay(&self, delay_millis: u32) {
        trace!(
            target: "segstore_throttle::metrics",
            container_id = self.container_id,
            delay_ms = delay_millis,
            "throttle delay recorded"
        );
    }
}

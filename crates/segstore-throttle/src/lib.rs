#![deny(unsafe_code)]
#![doc = r#"
# segstore-throttle

## 设计动机（Why）
- **定位**：段存储写入管线的准入控制/背压原语。管线在接受更多工作前先廉价地询问
  “是否需要放慢”，需要时按下游资源（缓存、持久化日志等）的压力等待一段时长。
- **难点**：把多个独立压力源聚合为单一决策；压力严重时反复重新度量并等待，且每次等待都有上限；
  允许外部事件（“某压力源刚刚缓解”）打断进行中的等待并立即重新计算；同时在生产方线程与
  异步通知线程并发访问下保持安全。

## 核心契约（What）
- [`ThrottlingCalculator`]：聚合已注册的 [`PressureSource`]，给出 `required` 与 [`ThrottlingDecision`]；
- [`Throttler`]：持有可取消的多周期等待状态机，对外暴露
  `is_throttling_required`/`throttle`/`notify_throttle_source_changed`/`close`/`is_closed`；
- [`Timer`]：可注入的延迟调度设施，生产环境使用 [`TokioTimer`]，测试使用 [`ManualTimer`]；
- [`MetricsSink`]：每个周期启动时接收一次时长。

## 实现策略（How）
- 当前周期存放在 `ArcSwapOption` 单槽位中，自然到期、通知与关闭通过比较交换争夺退役权；
- `throttle()` 返回的 Future 只在定时器的 `Delay` 中挂起，从不阻塞调用线程；
- 错误以 `thiserror` 建模并附带稳定错误码，关键状态迁移输出 `tracing` 结构化事件。

## 风险与考量（Trade-offs）
- 多个并发 `throttle()` 调用之间不保证公平，仅保证串行；
- 节流状态不持久化，也不跨进程协调。
"#]

pub mod calculator;
pub mod config;
pub mod cycle;
pub mod error;
pub mod metrics;
pub mod source;
/// 测试桩命名空间，集中暴露记录型指标出口，供集成测试与示例复用。
pub mod test_stubs;
pub mod throttler;
pub mod time;

pub use calculator::{MAX_DELAY_MILLIS, ThrottlingCalculator, ThrottlingDecision};
pub use config::ThrottlerConfig;
pub use cycle::{Cycle, CycleCancellation, CycleSlot};
pub use error::{ConfigurationError, PressureSourceError, Result, ThrottleError, TimerError};
pub use metrics::{MetricsSink, NoopMetricsSink, TracingMetricsSink};
pub use source::{AtomicPressureSource, PressureSource, ThrottlerName};
pub use throttler::{ThrottleFuture, Throttler};
pub use time::{Delay, ManualTimer, Timer, TokioTimer};

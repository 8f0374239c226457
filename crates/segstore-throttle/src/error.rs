//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义节流原语对外暴露的错误语义：配置错误、资源已关闭、压力源故障与调度设施故障；
//! - 每个错误都携带稳定错误码（`throttle.*`/`config.*`），便于运维按码聚合告警。
//!
//! ## 设计要求（What）
//! - 全部使用 `thiserror::Error` 派生，兼容 `std::error::Error`；
//! - 通过 `From` 实现串联各层错误，使调用链可以直接使用 `?` 传播；
//! - 通知（notify）导致的周期中断属于正常流程，**不**在此建模为错误。

use thiserror::Error;

use crate::source::ThrottlerName;

/// 压力源在计算 `required`/`delay` 时抛出的故障。
///
/// # 教案式说明
/// - **意图 (Why)**：压力源由外部子系统实现，读取其状态可能失败；若吞掉故障，背压会被静默关闭，
///   因此故障必须沿 `throttle()` 的完成结果向上传播。
/// - **契约 (What)**：`source_name` 指明出错的压力源，`detail` 为人类可读的诊断信息。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("pressure source `{source_name}` failed: {detail}")]
pub struct PressureSourceError {
    pub source_name: ThrottlerName,
    pub detail: String,
}

impl PressureSourceError {
    /// 构造压力源故障。
    pub fn new(source_name: ThrottlerName, detail: impl Into<String>) -> Self {
        Self {
            source_name,
            detail: detail.into(),
        }
    }

    /// 稳定错误码。
    pub const fn code(&self) -> &'static str {
        "throttle.source_fault"
    }
}

/// 定时设施无法登记延迟时返回的错误，例如共享执行器已不可用。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("timer could not schedule delay: {detail}")]
pub struct TimerError {
    pub detail: String,
}

impl TimerError {
    /// 构造调度失败错误。
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// 稳定错误码。
    pub const fn code(&self) -> &'static str {
        "throttle.scheduling"
    }
}

/// 装配阶段的配置错误，只会在构造期出现，绝不会在运行期出现。
///
/// - **意图 (Why)**：重复注册同名压力源属于装配缺陷，必须快速失败而不是静默覆盖；
/// - **契约 (What)**：所有变体都在 `ThrottlingCalculator`/`ThrottlerConfig` 构造时返回。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigurationError {
    /// 同一计算器内注册了两个同名压力源。
    #[error("pressure source `{name}` is already registered")]
    DuplicateSource { name: ThrottlerName },

    /// 单周期延迟上限不在 `1..=limit` 范围内。
    #[error("max delay {requested}ms is out of range (1..={limit}ms)")]
    InvalidMaxDelay { requested: u32, limit: u32 },

    /// 配置文本无法解析。
    #[error("throttler configuration could not be parsed: {detail}")]
    Parse { detail: String },
}

impl ConfigurationError {
    /// 稳定错误码。
    pub const fn code(&self) -> &'static str {
        match self {
            ConfigurationError::DuplicateSource { .. } => "config.duplicate_source",
            ConfigurationError::InvalidMaxDelay { .. } => "config.invalid_max_delay",
            ConfigurationError::Parse { .. } => "config.parse",
        }
    }
}

/// `throttle()` 完成结果可能携带的失败。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方要么观察到成功（节流期已兑现），要么拿到一个可记录、可重试的显式失败；
///   绝不允许出现“永久挂起”。
/// - **契约 (What)**：
///   - `Closed`：节流器已关闭，新的 `throttle()` 立即失败；关闭时正在等待的 `throttle()` 同样以此结束；
///   - `Source`：压力源故障；
///   - `Scheduling`：定时设施无法调度。
/// - **权衡 (Trade-offs)**：`Closed` 只携带容器编号，避免在热路径分配字符串。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ThrottleError {
    #[error("throttler for container {container_id} is closed")]
    Closed { container_id: u32 },

    #[error(transparent)]
    Source(#[from] PressureSourceError),

    #[error(transparent)]
    Scheduling(#[from] TimerError),
}

impl ThrottleError {
    /// 稳定错误码，委托给内部错误以保持码值唯一来源。
    pub const fn code(&self) -> &'static str {
        match self {
            ThrottleError::Closed { .. } => "throttle.closed",
            ThrottleError::Source(err) => err.code(),
            ThrottleError::Scheduling(err) => err.code(),
        }
    }

    /// 是否为“资源已关闭”类错误。
    pub const fn is_closed(&self) -> bool {
        matches!(self, ThrottleError::Closed { .. })
    }
}

/// 节流原语的结果别名。
pub type Result<T, E = ThrottleError> = std::result::Result<T, E>;

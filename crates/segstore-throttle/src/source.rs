//! 压力源契约：外部子系统（缓存、持久化日志队列等）通过它向节流计算器汇报“是否需要节流”与“建议等待时长”。
//!
//! # 模块定位（Why）
//! - 压力的度量方式属于各自子系统，本 crate 只消费其结果；
//! - 以能力接口 `{name, required, delay}` 取代类继承体系，计算器内部只保存“名称 → 压力源”的映射。
//!
//! # 结构概览（What）
//! - [`ThrottlerName`]：封闭的压力源名称集合；
//! - [`PressureSource`]：压力源能力接口；
//! - [`AtomicPressureSource`]：基于原子变量的现成实现，供子系统直接发布最新读数。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::PressureSourceError;

/// 压力源名称。
///
/// 同一个 [`ThrottlingCalculator`](crate::calculator::ThrottlingCalculator) 内名称必须唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThrottlerName {
    /// 缓存占用压力。
    Cache,
    /// 写入批处理节律。
    Batching,
    /// 持久化日志（DurableDataLog）排队深度。
    DurableDataLog,
    /// 操作日志（OperationLog）积压。
    OperationLog,
}

impl ThrottlerName {
    /// 稳定的小写标签，用于日志字段与错误信息。
    pub const fn as_str(self) -> &'static str {
        match self {
            ThrottlerName::Cache => "cache",
            ThrottlerName::Batching => "batching",
            ThrottlerName::DurableDataLog => "durable-data-log",
            ThrottlerName::OperationLog => "operation-log",
        }
    }
}

impl fmt::Display for ThrottlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 压力源能力接口。
///
/// # 教案式说明
/// - **意图 (Why)**：把“如何度量压力”完全留给外部子系统，计算器每次聚合时重新读取一次快照；
/// - **契约 (What)**：
///   - `name`：实例生命周期内保持不变；
///   - `is_throttling_required`：当前是否需要节流，必须廉价，会在热路径上频繁调用；
///   - `delay_millis`：建议等待的毫秒数，无压力时必须返回 `0` 而不是报错；
///   - 读取失败时返回 [`PressureSourceError`]，由节流器原样传播给 `throttle()` 的调用方；
/// - **风险 (Trade-offs)**：两次读取之间数值可能变化，计算器不会缓存，也不保证两个方法读到同一时刻的状态。
pub trait PressureSource: Send + Sync + 'static {
    /// 压力源名称。
    fn name(&self) -> ThrottlerName;

    /// 当前是否需要节流。
    fn is_throttling_required(&self) -> Result<bool, PressureSourceError>;

    /// 当前建议的等待时长（毫秒）。
    fn delay_millis(&self) -> Result<u32, PressureSourceError>;
}

/// 以原子变量保存最新读数的压力源。
///
/// 度量线程通过 `set_*` 发布（`Release`），计算器读取时使用 `Acquire`，无需任何锁。
#[derive(Debug)]
pub struct AtomicPressureSource {
    name: ThrottlerName,
    required: AtomicBool,
    delay_millis: AtomicU32,
}

impl AtomicPressureSource {
    /// 创建处于“无压力”状态的压力源。
    pub const fn new(name: ThrottlerName) -> Self {
        Self {
            name,
            required: AtomicBool::new(false),
            delay_millis: AtomicU32::new(0),
        }
    }

    /// 发布“是否需要节流”。
    pub fn set_throttling_required(&self, required: bool) {
        self.required.store(required, Ordering::Release);
    }

    /// 发布建议等待时长。
    pub fn set_delay_millis(&self, delay_millis: u32) {
        self.delay_millis.store(delay_millis, Ordering::Release);
    }
}

impl PressureSource for AtomicPressureSource {
    fn name(&self) -> ThrottlerName {
        self.name
    }

    fn is_throttling_required(&self) -> Result<bool, PressureSourceError> {
        Ok(self.required.load(Ordering::Acquire))
    }

    fn delay_millis(&self) -> Result<u32, PressureSourceError> {
        Ok(self.delay_millis.load(Ordering::Acquire))
    }
}

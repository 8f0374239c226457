//! 节流计算器：把一组已注册的压力源聚合为单一的节流决策。
//!
//! # 模块定位（Why）
//! - 节流器只关心“要不要等、等多久、等完是否还需要再等”，不关心压力来自缓存还是日志；
//! - 计算器是纯聚合函数，除注册表外不持有任何可变状态，可被热路径频繁调用。
//!
//! # 聚合规则（What）
//! - `is_throttling_required`：任一压力源要求节流即为 `true`；
//! - `throttling_delay`：取所有压力源建议延迟的**最大值**，再按上限截断；
//!   原始最大值严格大于上限时标记 `maxed_out`，提示节流器在本周期结束后立即开启下一周期。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigurationError, PressureSourceError};
use crate::source::{PressureSource, ThrottlerName};

/// 单个等待周期允许的最长时长（毫秒）。
///
/// 进程内所有计算器默认共享该上限：压力可能在等待期间缓解，单次等待越长，决策越陈旧。
pub const MAX_DELAY_MILLIS: u32 = 25_000;

/// 某一时刻的节流决策，按需计算、从不存储。
///
/// # 契约说明（What）
/// - `duration_millis <= 上限`；
/// - `maxed_out == true` 当且仅当原始最大延迟严格大于上限，此时 `duration_millis == 上限`（截断而非归零）；
/// - `source` 为决定本次延迟的压力源；没有任何压力源时为 `None`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottlingDecision {
    duration_millis: u32,
    maxed_out: bool,
    source: Option<ThrottlerName>,
}

impl ThrottlingDecision {
    /// 依据原始延迟与上限构造决策。
    pub fn capped(raw_millis: u32, max_delay_millis: u32, source: Option<ThrottlerName>) -> Self {
        Self {
            duration_millis: raw_millis.min(max_delay_millis),
            maxed_out: raw_millis > max_delay_millis,
            source,
        }
    }

    /// 本周期的等待时长（毫秒）。
    pub const fn duration_millis(&self) -> u32 {
        self.duration_millis
    }

    /// 本周期的等待时长。
    pub fn duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.duration_millis))
    }

    /// 原始延迟是否超过上限。
    pub const fn is_maxed_out(&self) -> bool {
        self.maxed_out
    }

    /// 决定本次延迟的压力源。
    pub const fn source(&self) -> Option<ThrottlerName> {
        self.source
    }
}

/// 压力源聚合器。
///
/// # 教案式说明
/// - **意图 (Why)**：以显式注册取代流式 Builder，构造期即可发现重复名称这类装配错误；
/// - **契约 (What)**：
///   - 名称在同一实例内唯一，重复注册返回 [`ConfigurationError::DuplicateSource`]，绝不覆盖；
///   - 迭代顺序固定为 [`ThrottlerName`] 的声明顺序，使并列最大值的归属可复现；
///   - 每次查询都重新读取压力源，不缓存任何读数；
/// - **风险 (Trade-offs)**：查询期间压力源报错会立即中止聚合并返回该错误，后续压力源不再被读取。
#[derive(Clone)]
pub struct ThrottlingCalculator {
    sources: BTreeMap<ThrottlerName, Arc<dyn PressureSource>>,
    max_delay_millis: u32,
}

impl ThrottlingCalculator {
    /// 以默认上限 [`MAX_DELAY_MILLIS`] 注册一组压力源。
    pub fn new(
        sources: impl IntoIterator<Item = Arc<dyn PressureSource>>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_max_delay(sources, MAX_DELAY_MILLIS)
    }

    /// 以自定义上限注册一组压力源，上限必须落在 `1..=MAX_DELAY_MILLIS`。
    pub fn with_max_delay(
        sources: impl IntoIterator<Item = Arc<dyn PressureSource>>,
        max_delay_millis: u32,
    ) -> Result<Self, ConfigurationError> {
        if max_delay_millis == 0 || max_delay_millis > MAX_DELAY_MILLIS {
            return Err(ConfigurationError::InvalidMaxDelay {
                requested: max_delay_millis,
                limit: MAX_DELAY_MILLIS,
            });
        }

        let mut calculator = Self {
            sources: BTreeMap::new(),
            max_delay_millis,
        };
        for source in sources {
            calculator.register(source)?;
        }
        Ok(calculator)
    }

    /// 注册单个压力源。
    pub fn register(&mut self, source: Arc<dyn PressureSource>) -> Result<(), ConfigurationError> {
        let name = source.name();
        if self.sources.contains_key(&name) {
            return Err(ConfigurationError::DuplicateSource { name });
        }
        self.sources.insert(name, source);
        Ok(())
    }

    /// 是否有任一压力源要求节流。无副作用，遇到第一个 `true` 即返回。
    pub fn is_throttling_required(&self) -> Result<bool, PressureSourceError> {
        for source in self.sources.values() {
            if source.is_throttling_required()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 读取全部压力源的建议延迟并聚合为一次决策。
    pub fn throttling_delay(&self) -> Result<ThrottlingDecision, PressureSourceError> {
        let mut raw_max = 0;
        let mut dominant = None;
        for (name, source) in &self.sources {
            let delay = source.delay_millis()?;
            if dominant.is_none() || delay > raw_max {
                raw_max = delay;
                dominant = Some(*name);
            }
        }
        Ok(ThrottlingDecision::capped(
            raw_max,
            self.max_delay_millis,
            dominant,
        ))
    }

    /// 本实例的单周期上限（毫秒）。
    pub const fn max_delay_millis(&self) -> u32 {
        self.max_delay_millis
    }

    /// 已注册的压力源数量。
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// 是否未注册任何压力源。
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// 已注册的压力源名称，按声明顺序排列。
    pub fn source_names(&self) -> impl Iterator<Item = ThrottlerName> + '_ {
        self.sources.keys().copied()
    }
}

impl fmt::Debug for ThrottlingCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlingCalculator")
            .field("sources", &self.source_names().collect::<Vec<_>>())
            .field("max_delay_millis", &self.max_delay_millis)
            .finish()
    }
}

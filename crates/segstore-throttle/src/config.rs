//! 节流器配置。
//!
//! # 设计目的（Why）
//! - 容器装配层通常从 TOML 片段中读取节流参数；本模块只负责解析与校验，不负责查找或加载文件；
//! - 校验在构造期完成，错误以 [`ConfigurationError`] 快速失败。
//!
//! # 契约说明（What）
//! - `container_id`：所属容器编号，默认 `0`，写入日志字段；
//! - `max_delay_millis`：单周期上限，默认 [`MAX_DELAY_MILLIS`]，只能调小不能调大；
//! - 未知字段直接拒绝，避免拼写错误被静默忽略。
//!
//! ```toml
//! container_id = 7
//! max_delay_millis = 10000
//! ```

use std::sync::Arc;

use serde::Deserialize;

use crate::calculator::{MAX_DELAY_MILLIS, ThrottlingCalculator};
use crate::error::ConfigurationError;
use crate::source::PressureSource;

/// 节流器装配参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottlerConfig {
    pub container_id: u32,
    pub max_delay_millis: u32,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            container_id: 0,
            max_delay_millis: MAX_DELAY_MILLIS,
        }
    }
}

impl ThrottlerConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigurationError::Parse {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验上限取值。
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_delay_millis == 0 || self.max_delay_millis > MAX_DELAY_MILLIS {
            return Err(ConfigurationError::InvalidMaxDelay {
                requested: self.max_delay_millis,
                limit: MAX_DELAY_MILLIS,
            });
        }
        Ok(())
    }

    /// 以本配置的上限注册压力源。
    pub fn build_calculator(
        &self,
        sources: impl IntoIterator<Item = Arc<dyn PressureSource>>,
    ) -> Result<ThrottlingCalculator, ConfigurationError> {
        ThrottlingCalculator::with_max_delay(sources, self.max_delay_millis)
    }
}

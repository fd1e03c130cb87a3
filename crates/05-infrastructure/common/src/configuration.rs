//! 注册表配置
//!
//! 配置来源按优先级从低到高：默认值、`config/registry.{toml,yaml,json}`、
//! `REGISTRY__` 前缀的环境变量（层级用双下划线分隔，例如
//! `REGISTRY__IMMEDIATE__DECAY_TIMEOUT_MS=500`）。

use crate::errors::{ConfigError, ConfigResult};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认配置文件路径（不含扩展名）
pub const DEFAULT_CONFIG_PATH: &str = "config/registry";

/// 环境变量前缀
pub const ENV_PREFIX: &str = "REGISTRY";

/// 注册表配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 注册表名称，用于日志和错误信息
    pub name: String,
    /// 严格模式：没有错误服务时构造失败直接返回错误，而不是记录后返回空
    pub strict_mode: bool,
    /// 即时作用域配置
    pub immediate: ImmediateConfig,
    /// 变更事件配置
    pub events: EventConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            strict_mode: false,
            immediate: ImmediateConfig::default(),
            events: EventConfig::default(),
        }
    }
}

/// 即时作用域配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImmediateConfig {
    /// 工作线程空闲多久后退出（毫秒）
    pub decay_timeout_ms: u64,
    /// 工作线程名称前缀
    pub worker_name_prefix: String,
}

impl Default for ImmediateConfig {
    fn default() -> Self {
        Self {
            decay_timeout_ms: 20_000,
            worker_name_prefix: "immediate-scope".to_string(),
        }
    }
}

/// 变更事件配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 广播通道容量
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl RegistryConfig {
    /// 从默认路径和环境变量加载
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// 从指定路径（不含扩展名）和环境变量加载，文件不存在时使用默认值
    pub fn load_from(base: &str) -> ConfigResult<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(base).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            "已加载注册表配置: name={}, strict_mode={}, decay={}ms",
            config.name,
            config.strict_mode,
            config.immediate.decay_timeout_ms
        );
        Ok(config)
    }

    /// 即时作用域工作线程的空闲超时
    pub fn decay_timeout(&self) -> Duration {
        Duration::from_millis(self.immediate.decay_timeout_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "注册表名称不能为空".to_string(),
            });
        }
        if self.immediate.decay_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "immediate.decay_timeout_ms 必须大于 0".to_string(),
            });
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::ValidationError {
                message: "events.channel_capacity 必须大于 0".to_string(),
            });
        }
        Ok(())
    }
}

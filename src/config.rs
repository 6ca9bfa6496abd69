//! 分片引擎配置
//!
//! [`SplitConfig`] 是整个引擎的唯一配置入口，所有字段在构造时完成校验。
//! 三种构造方式：
//!
//! | 方式 | 适用场景 |
//! |------|----------|
//! | [`SplitConfig::default`] | 直接使用文档默认值（分片关闭） |
//! | [`SplitConfig::builder`] | 代码内显式配置，`build()` 时统一校验 |
//! | [`SplitConfig::from_env`] | 从 `AGENT_SPLIT_*` 环境变量加载 |

use crate::error::{ConfigError, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── 分片策略 ──────────────────────────────────────────────────────────────────

/// 超限记录的分片策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// 语义分片：按 channel 的 messages 序列切块，主记录保留骨架
    #[serde(rename = "MESSAGE_LEVEL")]
    MessageLevel,
    /// 不透明分片：整体序列化后 Base64 编码再按长度切块
    #[serde(rename = "CONTENT_LEVEL")]
    ContentLevel,
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitStrategy::MessageLevel => write!(f, "MESSAGE_LEVEL"),
            SplitStrategy::ContentLevel => write!(f, "CONTENT_LEVEL"),
        }
    }
}

impl SplitStrategy {
    fn parse(s: &str) -> std::result::Result<Self, ConfigError> {
        match s.to_uppercase().as_str() {
            "MESSAGE_LEVEL" => Ok(SplitStrategy::MessageLevel),
            "CONTENT_LEVEL" => Ok(SplitStrategy::ContentLevel),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

// ── SplitConfig ───────────────────────────────────────────────────────────────

/// 校验通过的分片引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// 是否启用分片（关闭时所有写入走单条直写）
    pub enabled: bool,
    /// 估算大小超过该字节数才考虑分片（严格大于）
    pub max_size_threshold: u64,
    /// 分片策略
    pub strategy: SplitStrategy,
    /// 单个分片负载的字节上限
    pub max_chunk_size: u64,
    /// 是否输出大小分析日志
    pub enable_size_monitoring: bool,
    /// 辅助分片的 record_id 前缀
    pub split_record_prefix: String,
    /// 单个分片的写入尝试总次数
    pub max_retries: u32,
    /// 单次操作的整体 deadline（毫秒）
    pub operation_timeout_ms: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_threshold: 358_400,
            strategy: SplitStrategy::MessageLevel,
            max_chunk_size: 307_200,
            enable_size_monitoring: true,
            split_record_prefix: "split".to_string(),
            max_retries: 3,
            operation_timeout_ms: 30_000,
        }
    }
}

impl SplitConfig {
    pub fn builder() -> SplitConfigBuilder {
        SplitConfigBuilder {
            config: SplitConfig::default(),
        }
    }

    /// 从 `AGENT_SPLIT_*` 环境变量加载配置，未设置的键使用默认值
    ///
    /// | 环境变量 | 字段 |
    /// |----------|------|
    /// | `AGENT_SPLIT_ENABLED` | `enabled` |
    /// | `AGENT_SPLIT_MAX_SIZE_THRESHOLD` | `max_size_threshold` |
    /// | `AGENT_SPLIT_STRATEGY` | `strategy`（`MESSAGE_LEVEL` / `CONTENT_LEVEL`） |
    /// | `AGENT_SPLIT_MAX_CHUNK_SIZE` | `max_chunk_size` |
    /// | `AGENT_SPLIT_SIZE_MONITORING` | `enable_size_monitoring` |
    /// | `AGENT_SPLIT_RECORD_PREFIX` | `split_record_prefix` |
    /// | `AGENT_SPLIT_MAX_RETRIES` | `max_retries` |
    /// | `AGENT_SPLIT_OPERATION_TIMEOUT_MS` | `operation_timeout_ms` |
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mut config = SplitConfig::default();
        if let Some(v) = env_var("AGENT_SPLIT_ENABLED") {
            config.enabled = parse_bool("AGENT_SPLIT_ENABLED", &v)?;
        }
        if let Some(v) = env_var("AGENT_SPLIT_MAX_SIZE_THRESHOLD") {
            config.max_size_threshold = parse_u64("AGENT_SPLIT_MAX_SIZE_THRESHOLD", &v)?;
        }
        if let Some(v) = env_var("AGENT_SPLIT_STRATEGY") {
            config.strategy = SplitStrategy::parse(&v)?;
        }
        if let Some(v) = env_var("AGENT_SPLIT_MAX_CHUNK_SIZE") {
            config.max_chunk_size = parse_u64("AGENT_SPLIT_MAX_CHUNK_SIZE", &v)?;
        }
        if let Some(v) = env_var("AGENT_SPLIT_SIZE_MONITORING") {
            config.enable_size_monitoring = parse_bool("AGENT_SPLIT_SIZE_MONITORING", &v)?;
        }
        if let Some(v) = env_var("AGENT_SPLIT_RECORD_PREFIX") {
            config.split_record_prefix = v;
        }
        if let Some(v) = env_var("AGENT_SPLIT_MAX_RETRIES") {
            config.max_retries = parse_u64("AGENT_SPLIT_MAX_RETRIES", &v)? as u32;
        }
        if let Some(v) = env_var("AGENT_SPLIT_OPERATION_TIMEOUT_MS") {
            config.operation_timeout_ms = parse_u64("AGENT_SPLIT_OPERATION_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// 校验所有字段是否落在文档允许的范围内
    pub fn validate(&self) -> Result<()> {
        check_range(
            "max_size_threshold",
            self.max_size_threshold,
            100_000,
            400_000,
        )?;
        check_range("max_chunk_size", self.max_chunk_size, 50_000, 350_000)?;
        check_range("max_retries", self.max_retries as u64, 1, 10)?;
        check_range(
            "operation_timeout_ms",
            self.operation_timeout_ms,
            5_000,
            120_000,
        )?;
        if self.split_record_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix.into());
        }
        Ok(())
    }
}

/// `SplitConfig` 的构建器
pub struct SplitConfigBuilder {
    config: SplitConfig,
}

impl SplitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn max_size_threshold(mut self, bytes: u64) -> Self {
        self.config.max_size_threshold = bytes;
        self
    }

    pub fn strategy(mut self, strategy: SplitStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn max_chunk_size(mut self, bytes: u64) -> Self {
        self.config.max_chunk_size = bytes;
        self
    }

    pub fn enable_size_monitoring(mut self, enabled: bool) -> Self {
        self.config.enable_size_monitoring = enabled;
        self
    }

    pub fn split_record_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.split_record_prefix = prefix.into();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.operation_timeout_ms = ms;
        self
    }

    /// 校验并返回配置
    pub fn build(self) -> Result<SplitConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvParseError(format!("{}={}", key, value))),
    }
}

fn parse_u64(key: &str, value: &str) -> std::result::Result<u64, ConfigError> {
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::EnvParseError(format!("{}={}", key, value)))
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> std::result::Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

use std::fmt;

/// checkpoint 存储引擎的统一错误类型
#[derive(Debug)]
pub enum CheckpointError {
    /// 配置错误
    Config(ConfigError),
    /// 序列化/反序列化错误
    Serialization(SerializationError),
    /// 分片写入错误（重试耗尽，已尽力回滚）
    Split(SplitError),
    /// 校验和不匹配
    Checksum(ChecksumError),
    /// 操作超时
    Timeout(TimeoutError),
    /// 底层 RecordStore 错误
    Store(StoreError),
    /// 其他错误
    Other(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置项超出允许范围
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    /// 分片记录前缀不能为空
    EmptyPrefix,
    /// 未知的分片策略
    UnknownStrategy(String),
    /// 环境变量解析失败
    EnvParseError(String),
}

/// 序列化/反序列化错误
#[derive(Debug)]
pub enum SerializationError {
    /// 编码失败（如不可序列化的结构）
    Encode(String),
    /// 解码失败
    Decode(String),
}

/// 分片写入错误
#[derive(Debug)]
pub enum SplitError {
    /// 某个分片在重试耗尽后仍写入失败（已尽力回滚已写入的分片）
    WriteExhausted {
        record_id: String,
        attempts: u32,
        cause: String,
    },
}

/// 校验和错误
#[derive(Debug)]
pub enum ChecksumError {
    /// 分片内容与记录的校验和不一致
    Mismatch {
        part_number: u32,
        expected: String,
        actual: String,
    },
}

/// 超时错误
#[derive(Debug)]
pub enum TimeoutError {
    /// 重组超出 deadline
    Reassembly { elapsed_ms: u64, timeout_ms: u64 },
    /// 写入超出 deadline
    Write { elapsed_ms: u64, timeout_ms: u64 },
}

/// 底层存储错误
#[derive(Debug)]
pub enum StoreError {
    /// 后端不可用或内部错误
    Backend(String),
    /// 单条记录超出存储的单条上限
    ItemTooLarge { record_id: String, size: u64 },
}

// ── Display impls ────────────────────────────────────────────────────────────

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Config(e) => write!(f, "Config Error: {}", e),
            CheckpointError::Serialization(e) => write!(f, "Serialization Error: {}", e),
            CheckpointError::Split(e) => write!(f, "Split Error: {}", e),
            CheckpointError::Checksum(e) => write!(f, "Checksum Error: {}", e),
            CheckpointError::Timeout(e) => write!(f, "Timeout Error: {}", e),
            CheckpointError::Store(e) => write!(f, "Store Error: {}", e),
            CheckpointError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::OutOfRange {
                field,
                value,
                min,
                max,
            } => {
                write!(
                    f,
                    "配置项 {} = {} 超出允许范围 [{}, {}]",
                    field, value, min, max
                )
            }
            ConfigError::EmptyPrefix => write!(f, "split_record_prefix 不能为空"),
            ConfigError::UnknownStrategy(s) => write!(f, "未知的分片策略: {}", s),
            ConfigError::EnvParseError(key) => write!(f, "环境变量解析失败: {}", key),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Encode(msg) => write!(f, "Encode failed: {}", msg),
            SerializationError::Decode(msg) => write!(f, "Decode failed: {}", msg),
        }
    }
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitError::WriteExhausted {
                record_id,
                attempts,
                cause,
            } => write!(
                f,
                "Failed to store part '{}' after {} attempts: {}",
                record_id, attempts, cause
            ),
        }
    }
}

impl fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumError::Mismatch {
                part_number,
                expected,
                actual,
            } => write!(
                f,
                "Checksum mismatch in part {}: expected {}, got {}",
                part_number, expected, actual
            ),
        }
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutError::Reassembly {
                elapsed_ms,
                timeout_ms,
            } => write!(
                f,
                "Reassembly timed out after {}ms (limit {}ms)",
                elapsed_ms, timeout_ms
            ),
            TimeoutError::Write {
                elapsed_ms,
                timeout_ms,
            } => write!(
                f,
                "Write timed out after {}ms (limit {}ms)",
                elapsed_ms, timeout_ms
            ),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "Backend error: {}", msg),
            StoreError::ItemTooLarge { record_id, size } => {
                write!(f, "Item '{}' too large: {} bytes", record_id, size)
            }
        }
    }
}

// ── std::error::Error impls with source() chain ──────────────────────────────

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Config(e) => Some(e),
            CheckpointError::Serialization(e) => Some(e),
            CheckpointError::Split(e) => Some(e),
            CheckpointError::Checksum(e) => Some(e),
            CheckpointError::Timeout(e) => Some(e),
            CheckpointError::Store(e) => Some(e),
            CheckpointError::Other(_) => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for SerializationError {}
impl std::error::Error for SplitError {}
impl std::error::Error for ChecksumError {}
impl std::error::Error for TimeoutError {}
impl std::error::Error for StoreError {}

// ── From 转换实现 ─────────────────────────────────────────────────────────────

impl From<ConfigError> for CheckpointError {
    fn from(err: ConfigError) -> Self {
        CheckpointError::Config(err)
    }
}

impl From<SerializationError> for CheckpointError {
    fn from(err: SerializationError) -> Self {
        CheckpointError::Serialization(err)
    }
}

impl From<SplitError> for CheckpointError {
    fn from(err: SplitError) -> Self {
        CheckpointError::Split(err)
    }
}

impl From<ChecksumError> for CheckpointError {
    fn from(err: ChecksumError) -> Self {
        CheckpointError::Checksum(err)
    }
}

impl From<TimeoutError> for CheckpointError {
    fn from(err: TimeoutError) -> Self {
        CheckpointError::Timeout(err)
    }
}

impl From<StoreError> for CheckpointError {
    fn from(err: StoreError) -> Self {
        CheckpointError::Store(err)
    }
}

/// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, CheckpointError>;

//! 纯分析器：记录大小估算、分片可行性判定、短校验和
//!
//! 这里没有任何 I/O。写入路径先问这里"这条记录要不要分片、大概分几片"，
//! 再去驱动实际的分片写入。
//!
//! 大小估算模型：序列化后的 UTF-8 字节数乘以 Base64 膨胀系数 1.33（向上取整），
//! 近似记录在存储中的传输编码大小；再加每条记录 1024 字节的存储侧固定开销。

use crate::config::{SplitConfig, SplitStrategy};
use crate::error::{Result, SerializationError};
use crate::store::{Checkpoint, Metadata};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Base64 编码的膨胀系数
pub(crate) const BASE64_OVERHEAD_FACTOR: f64 = 1.33;

/// 存储侧单条记录的固定开销（字节），对 KV 存储条目元数据的保守上界
pub(crate) const STORE_OVERHEAD_BYTES: u64 = 1024;

/// 短校验和保留的十六进制位数
const CHECKSUM_HEX_LEN: usize = 16;

/// `can_split` 抽样验证的消息条数上限
const SAMPLE_MESSAGES: usize = 5;

// ── 分析结果类型 ──────────────────────────────────────────────────────────────

/// 各逻辑组成部分的字节占比
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeBreakdown {
    pub checkpoint: u64,
    pub metadata: u64,
    pub overhead: u64,
}

/// 两个负载中较大的那个（平手时 checkpoint 胜出）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargestComponent {
    Checkpoint,
    Metadata,
}

/// 最大的携带消息的 channel
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub name: String,
    pub message_count: usize,
    pub estimated_size: u64,
}

/// `analyze` 的输出
#[derive(Debug, Clone)]
pub struct SizeAnalysis {
    /// 估算总大小（字节）
    pub total_size: u64,
    /// 是否严格超过 `max_size_threshold`
    pub exceeds_threshold: bool,
    pub size_breakdown: SizeBreakdown,
    pub largest_component: LargestComponent,
    /// 按当前策略估算的分片数
    pub estimated_parts: u32,
    /// 最大的携带 `messages` 序列的 channel，没有则为 `None`
    pub largest_channel: Option<ChannelStats>,
}

/// `can_split` 的判定结果
#[derive(Debug, Clone)]
pub struct SplitVerdict {
    pub ok: bool,
    pub reason: Option<String>,
}

impl SplitVerdict {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

// ── 核心操作 ──────────────────────────────────────────────────────────────────

/// 规范序列化：保持对象 key 插入顺序的 UTF-8 JSON
///
/// 写入和读取路径都必须走这里，分片内容的校验和才能逐字节复现。
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| SerializationError::Encode(e.to_string()).into())
}

/// SHA-256 小写十六进制，截取前 16 位
pub fn short_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(CHECKSUM_HEX_LEN);
    hex
}

/// 估算 `(checkpoint, metadata)` 的存储大小并给出分片判定依据
pub fn analyze(
    checkpoint: &Checkpoint,
    metadata: &Metadata,
    config: &SplitConfig,
) -> Result<SizeAnalysis> {
    let checkpoint_json = to_canonical_json(checkpoint)?;
    let metadata_json = to_canonical_json(metadata)?;

    let checkpoint_size = encoded_size(checkpoint_json.len());
    let metadata_size = encoded_size(metadata_json.len());
    let total_size = checkpoint_size + metadata_size + STORE_OVERHEAD_BYTES;

    let largest_component = if checkpoint_size >= metadata_size {
        LargestComponent::Checkpoint
    } else {
        LargestComponent::Metadata
    };

    let mut largest_channel: Option<ChannelStats> = None;
    let mut message_channel_sizes: Vec<u64> = Vec::new();
    for (name, value) in message_channels(checkpoint) {
        let channel_size = to_canonical_json(value)?.len() as u64;
        let message_count = channel_messages(value).map(|m| m.len()).unwrap_or(0);
        if message_count > 0 {
            message_channel_sizes.push(channel_size);
        }
        let is_new_max = largest_channel
            .as_ref()
            .map(|c| channel_size > c.estimated_size)
            .unwrap_or(true);
        if is_new_max {
            largest_channel = Some(ChannelStats {
                name: name.to_string(),
                message_count,
                estimated_size: channel_size,
            });
        }
    }

    let estimated_parts = match config.strategy {
        SplitStrategy::ContentLevel => ceil_div(total_size, config.max_chunk_size),
        SplitStrategy::MessageLevel => {
            1 + message_channel_sizes
                .iter()
                .map(|s| ceil_div(*s, config.max_chunk_size))
                .sum::<u32>()
        }
    };

    Ok(SizeAnalysis {
        total_size,
        exceeds_threshold: total_size > config.max_size_threshold,
        size_breakdown: SizeBreakdown {
            checkpoint: checkpoint_size,
            metadata: metadata_size,
            overhead: STORE_OVERHEAD_BYTES,
        },
        largest_component,
        estimated_parts,
        largest_channel,
    })
}

/// 判定 checkpoint 能否用给定策略分片
///
/// - `CONTENT_LEVEL` 对负载形状没有要求，恒可行
/// - `MESSAGE_LEVEL` 要求至少一个 channel 带非空 `messages` 序列，
///   且抽样的前几条消息能通过规范序列化往返
pub fn can_split(checkpoint: &Checkpoint, strategy: SplitStrategy) -> SplitVerdict {
    match strategy {
        SplitStrategy::ContentLevel => SplitVerdict::ok(),
        SplitStrategy::MessageLevel => {
            let mut found_messages = false;
            for (name, value) in message_channels(checkpoint) {
                let Some(messages) = channel_messages(value) else {
                    continue;
                };
                if messages.is_empty() {
                    continue;
                }
                found_messages = true;
                let sample = messages.len().min(SAMPLE_MESSAGES);
                for (i, message) in messages.iter().take(sample).enumerate() {
                    if !round_trips(message) {
                        return SplitVerdict::rejected(format!(
                            "Message {} in channel {} is not serializable",
                            i, name
                        ));
                    }
                }
            }
            if !found_messages {
                return SplitVerdict::rejected("No messages found to split");
            }
            SplitVerdict::ok()
        }
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

/// `ceil(len × 1.33)`：近似 Base64 编码后的字节数
fn encoded_size(raw_len: usize) -> u64 {
    (raw_len as f64 * BASE64_OVERHEAD_FACTOR).ceil() as u64
}

fn ceil_div(size: u64, chunk: u64) -> u32 {
    (size.div_ceil(chunk.max(1))) as u32
}

/// 迭代携带 `messages` 序列的 channel
fn message_channels<'a>(
    checkpoint: &'a Checkpoint,
) -> impl Iterator<Item = (&'a String, &'a Value)> {
    checkpoint
        .iter()
        .filter(|(_, value)| channel_messages(value).is_some())
}

pub(crate) fn channel_messages(value: &Value) -> Option<&Vec<Value>> {
    value.as_object()?.get("messages")?.as_array()
}

fn round_trips(message: &Value) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => serde_json::from_str::<Value>(&json).is_ok(),
        Err(_) => false,
    }
}

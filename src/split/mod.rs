//! 超限记录的分片与重组
//!
//! 当一条 `(checkpoint, metadata)` 记录的估算大小超过底层 KV 存储的单条上限时，
//! 本模块在写入时将其透明地拆成一组分片记录，读取时再完整重组。
//!
//! | 组件 | 职责 |
//! |------|------|
//! | [`splitter::CheckpointSplitter`] | 写入路径：策略选择、切块、重试与回滚 |
//! | [`reassembler::CheckpointReassembler`] | 读取路径：deadline 内收集分片、校验、重组 |
//!
//! 两种策略（见 [`SplitStrategy`](crate::config::SplitStrategy)）：
//!
//! - **MESSAGE_LEVEL**：按 channel 的 `messages` 序列切块。主记录（part 0）
//!   保留清空了 messages 的 checkpoint 骨架，辅助分片（part 1..N-1）各携带一段消息。
//! - **CONTENT_LEVEL**：整体序列化后 Base64 编码，按长度切成 part 1..N。
//!   part 1 直接存放在逻辑 record_id 上，没有独立的骨架主记录。
//!
//! 辅助分片的 key 形如 `"{prefix}#{original_record_id}#part#{NNNN}"`（4 位零填充），
//! 对调用方完全不可见：`list` 会过滤掉它们，`delete_thread` 会连带清理。

pub mod reassembler;
pub mod splitter;

pub use reassembler::CheckpointReassembler;
pub use splitter::CheckpointSplitter;

use crate::config::SplitStrategy;
use crate::store::{Checkpoint, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── 分片描述符 ────────────────────────────────────────────────────────────────

/// 分片集的元数据，挂在每个分片记录的 `splitMetadata` 字段上
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitMetadata {
    /// 逻辑记录的主键
    pub original_record_id: String,
    /// 分片集的总分片数（含主记录）
    pub total_parts: u32,
    /// 分片序号：MESSAGE_LEVEL 的主记录为 0，辅助分片从 1 起；
    /// CONTENT_LEVEL 没有独立主记录，序号从 1 起
    pub part_number: u32,
    /// 产生该分片集的策略
    pub strategy: SplitStrategy,
    /// 分片集创建时间（ISO-8601）
    pub split_timestamp: String,
    /// 编码前的负载字节数：MESSAGE_LEVEL 为清空消息后的主记录负载，
    /// CONTENT_LEVEL 为整体序列化负载
    pub original_size: u64,
    /// 本分片负载的字节数
    pub part_size: u64,
    /// 本分片负载的短校验和（SHA-256 前 16 位十六进制），重组时比对
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// MESSAGE_LEVEL 辅助分片的负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSplitData {
    /// 消息所属的 channel 名
    pub channel_name: String,
    /// 本分片在原始消息序列中的起始下标（含）
    pub start_message_index: usize,
    /// 本分片在原始消息序列中的结束下标（不含）
    pub end_message_index: usize,
    /// 序列化后的消息数组
    pub messages_data: String,
    /// 切块时的 channel 快照信息
    pub checkpoint_metadata: ChunkCheckpointMetadata,
}

/// 切块时记录的 channel 快照信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCheckpointMetadata {
    /// 该 channel 分片前的消息总数
    pub total_messages: usize,
    /// 该 channel 的版本标记（若有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_version: Option<Value>,
}

/// CONTENT_LEVEL 分片的负载
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSplitData {
    /// Base64 串的一段连续子串
    pub chunk_data: String,
    /// 负载编码，固定为 `"base64"`
    pub encoding: String,
}

// ── 写入结果 ──────────────────────────────────────────────────────────────────

/// `split_if_needed` 的返回值
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    /// 是否实际发生了分片写入
    pub was_split: bool,
    /// 涉及的 record_id 列表；未分片时只含逻辑主键
    pub record_ids: Vec<String>,
}

// ── 重组选项与结果 ────────────────────────────────────────────────────────────

/// 重组行为开关
#[derive(Debug, Clone)]
pub struct ReassemblyOptions {
    /// 是否比对每个分片的校验和
    pub validate_checksums: bool,
    /// 收集分片的整体 deadline（毫秒）
    pub timeout_ms: u64,
    /// 是否输出逐分片的重组日志
    pub enable_logging: bool,
}

impl Default for ReassemblyOptions {
    fn default() -> Self {
        Self {
            validate_checksums: true,
            timeout_ms: 30_000,
            enable_logging: false,
        }
    }
}

/// 重组的结构化结果
///
/// 重组路径的失败不抛错：`success = false` 加 `warnings`，
/// 由上层（Storage Adapter）决定如何呈现。
#[derive(Debug)]
pub struct ReassemblyResult {
    pub success: bool,
    /// 重组出的 `(checkpoint, metadata)`，失败时为 `None`
    pub data: Option<(Checkpoint, Metadata)>,
    /// 过程中累积的告警（缺片、校验失败、超时等）
    pub warnings: Vec<String>,
    /// 重组耗时（毫秒）
    pub reassembly_time_ms: u64,
    /// 实际参与重组的分片数
    pub parts_reassembled: u32,
    /// 元数据声明的总分片数
    pub total_expected_parts: u32,
}

impl ReassemblyResult {
    pub(crate) fn failure(warnings: Vec<String>, elapsed_ms: u64, found: u32, expected: u32) -> Self {
        Self {
            success: false,
            data: None,
            warnings,
            reassembly_time_ms: elapsed_ms,
            parts_reassembled: found,
            total_expected_parts: expected,
        }
    }
}

// ── key 派生 ──────────────────────────────────────────────────────────────────

/// 辅助分片的 record_id：`"{prefix}#{original}#part#{NNNN}"`
pub(crate) fn aux_record_id(prefix: &str, original_record_id: &str, part_number: u32) -> String {
    format!("{}#{}#part#{:04}", prefix, original_record_id, part_number)
}

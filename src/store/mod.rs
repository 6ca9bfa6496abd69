//! RecordStore 抽象
//!
//! 引擎只依赖这里定义的最小 KV 语义，不关心背后是 DynamoDB、关系库还是内存表。
//! 记录按 `(thread_id, record_id)` 定位：`thread_id` 是分区键（一个会话线程一个），
//! `record_id` 是排序键。
//!
//! ## 内置实现
//!
//! | 类型 | 说明 |
//! |------|------|
//! | [`InMemoryRecordStore`] | 进程内存，重启即清空，适合测试与嵌入场景 |

pub mod memory;

pub use memory::InMemoryRecordStore;

use crate::error::Result;
use crate::split::{ContentSplitData, MessageSplitData, SplitMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// checkpoint 负载：channel 名到 channel 值的有序映射
pub type Checkpoint = Map<String, Value>;

/// 逻辑记录附带的元数据映射
pub type Metadata = Map<String, Value>;

// ── StoredRecord ─────────────────────────────────────────────────────────────

/// KV 存储中的一行记录
///
/// 既可以是一条完整的逻辑记录（`is_split = false` 或缺省），
/// 也可以是分片集的一个成员（`is_split = true` 且带 `split_metadata`）。
/// 历史数据没有 `isSplit` 字段，反序列化时按 `false` 处理，永远可读。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// 分区键：所属会话线程
    pub thread_id: String,
    /// 排序键
    pub record_id: String,
    /// 序列化后的 checkpoint（非分片记录与 MESSAGE_LEVEL 主记录携带）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// 序列化后的 metadata（与 `checkpoint` 同时出现）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    /// 是否属于某个分片集
    #[serde(default)]
    pub is_split: bool,
    /// 分片描述符，`is_split = true` 时必有
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_metadata: Option<SplitMetadata>,
    /// MESSAGE_LEVEL 辅助分片的消息负载
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_split_data: Option<MessageSplitData>,
    /// CONTENT_LEVEL 分片的 Base64 负载
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_split_data: Option<ContentSplitData>,
}

impl StoredRecord {
    /// 构造一条未分片的完整记录
    pub fn plain(
        thread_id: impl Into<String>,
        record_id: impl Into<String>,
        checkpoint: String,
        metadata: String,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            record_id: record_id.into(),
            checkpoint: Some(checkpoint),
            metadata: Some(metadata),
            is_split: false,
            split_metadata: None,
            message_split_data: None,
            content_split_data: None,
        }
    }
}

// ── RecordStore trait ─────────────────────────────────────────────────────────

/// 引擎依赖的最小存储接口
///
/// 实现方只需保证：
/// - `get` 是强读，返回该 key 最近一次成功写入的记录
/// - `create` 是无条件 upsert（引擎在单次操作内不会并发写同一个 key）
/// - `delete` 幂等，删除不存在的记录不报错
/// - `query_by_thread` 按 `record_id` 排序返回该线程下（可选前缀匹配的）全部记录
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 按主键读取单条记录
    async fn get(&self, thread_id: &str, record_id: &str) -> Result<Option<StoredRecord>>;

    /// 写入（或覆盖）单条记录
    async fn create(&self, record: StoredRecord) -> Result<()>;

    /// 删除单条记录（幂等）
    async fn delete(&self, thread_id: &str, record_id: &str) -> Result<()>;

    /// 枚举线程下的记录，按 `record_id` 升序；`key_prefix` 为空时返回全部
    async fn query_by_thread(
        &self,
        thread_id: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StoredRecord>>;
}

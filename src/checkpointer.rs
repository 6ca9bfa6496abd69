//! 面向调用方的 checkpoint 存储门面
//!
//! 按 `thread_id` 将会话状态快照持久化到任意 [`RecordStore`] 后端，
//! 超限记录的分片/重组对调用方完全透明。
//!
//! | 操作 | 行为 |
//! |------|------|
//! | [`put`](CheckpointStore::put) | 超限则分片写入，否则整条直写 |
//! | [`get_tuple`](CheckpointStore::get_tuple) | 读取并按需重组；损坏的分片集按"不存在"降级 |
//! | [`list`](CheckpointStore::list) | 按 record_id 升序枚举，过滤辅助分片并即时重组 |
//! | [`delete_thread`](CheckpointStore::delete_thread) | 删除线程下全部记录，含辅助分片 |
//!
//! ## 快速上手
//!
//! ```rust,no_run
//! use echo_checkpoint::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> echo_checkpoint::error::Result<()> {
//! let store = Arc::new(InMemoryRecordStore::new());
//! let config = SplitConfig::builder().enabled(true).build()?;
//! let checkpoints = CheckpointStore::new(store, config);
//!
//! let key = CheckpointKey::new("alice-thread-1", "", "ckpt-0001");
//! let checkpoint = serde_json::Map::new();
//! let metadata = serde_json::Map::new();
//! checkpoints.put(&key, &checkpoint, &metadata, &Default::default()).await?;
//!
//! if let Some(tuple) = checkpoints.get_tuple(&key).await? {
//!     println!("恢复到 {} 个 channel", tuple.checkpoint.len());
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::SplitConfig;
use crate::error::Result;
use crate::sizer;
use crate::split::{CheckpointReassembler, CheckpointSplitter, ReassemblyOptions};
use crate::store::{Checkpoint, Metadata, RecordStore, StoredRecord};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// channel 版本映射，由上层图运行时维护；存储层只透传
pub type ChannelVersions = Map<String, Value>;

// ── CheckpointKey ────────────────────────────────────────────────────────────

/// 逻辑记录的定位键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointKey {
    /// 会话线程标识（分区键）
    pub thread_id: String,
    /// checkpoint 命名空间，可为空串
    pub checkpoint_ns: String,
    /// checkpoint 标识
    pub checkpoint_id: String,
}

impl CheckpointKey {
    pub fn new(
        thread_id: impl Into<String>,
        checkpoint_ns: impl Into<String>,
        checkpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: checkpoint_ns.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }

    /// 存储侧排序键：`"checkpoint#{ns}#{id}"`
    pub fn record_id(&self) -> String {
        format!("checkpoint#{}#{}", self.checkpoint_ns, self.checkpoint_id)
    }
}

/// 一次读取返回的完整快照
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub key: CheckpointKey,
    pub checkpoint: Checkpoint,
    pub metadata: Metadata,
}

// ── CheckpointStore ──────────────────────────────────────────────────────────

/// checkpoint 存储门面
///
/// 自身不持有任何跨请求状态，可以 `Arc` 共享后在任意任务里并发调用。
pub struct CheckpointStore {
    store: Arc<dyn RecordStore>,
    config: SplitConfig,
    splitter: CheckpointSplitter,
    reassembler: CheckpointReassembler,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn RecordStore>, config: SplitConfig) -> Self {
        Self {
            splitter: CheckpointSplitter::new(config.clone()),
            reassembler: CheckpointReassembler::new(config.clone()),
            store,
            config,
        }
    }

    /// 保存一个快照，返回其定位键
    ///
    /// `new_versions` 是上层图运行时的版本簿记，存储层原样接受但不使用。
    pub async fn put(
        &self,
        key: &CheckpointKey,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
        _new_versions: &ChannelVersions,
    ) -> Result<CheckpointKey> {
        let record_id = key.record_id();
        let outcome = self
            .splitter
            .split_if_needed(
                &key.thread_id,
                &record_id,
                checkpoint,
                metadata,
                self.store.as_ref(),
            )
            .await?;

        if !outcome.was_split {
            let record = StoredRecord::plain(
                key.thread_id.clone(),
                record_id.clone(),
                sizer::to_canonical_json(checkpoint)?,
                sizer::to_canonical_json(metadata)?,
            );
            self.store.create(record).await?;
        }
        info!(
            thread_id = %key.thread_id,
            record_id = %record_id,
            was_split = outcome.was_split,
            parts = outcome.record_ids.len(),
            "🔖 快照已保存"
        );
        Ok(key.clone())
    }

    /// 读取一个快照；不存在或分片集无法重组时返回 `None`
    pub async fn get_tuple(&self, key: &CheckpointKey) -> Result<Option<CheckpointTuple>> {
        let record_id = key.record_id();
        let Some(record) = self.store.get(&key.thread_id, &record_id).await? else {
            return Ok(None);
        };

        if !record.is_split {
            // 未分片（含历史数据）：就地解码，不经过重组器
            return Ok(Some(decode_plain(key.clone(), &record)?));
        }

        let result = self
            .reassembler
            .reassemble(
                &key.thread_id,
                &record_id,
                self.store.as_ref(),
                &self.reassembly_options(),
            )
            .await?;
        if !result.success {
            warn!(
                thread_id = %key.thread_id,
                record_id = %record_id,
                warnings = ?result.warnings,
                "🧩 分片集重组失败，按不存在处理"
            );
            return Ok(None);
        }
        let Some((checkpoint, metadata)) = result.data else {
            return Ok(None);
        };
        Ok(Some(CheckpointTuple {
            key: key.clone(),
            checkpoint,
            metadata,
        }))
    }

    /// 枚举线程下的全部快照，按 record_id 升序
    ///
    /// 辅助分片对调用方不可见；无法重组的分片集记一条告警后跳过。
    pub async fn list(
        &self,
        thread_id: &str,
        checkpoint_ns: Option<&str>,
    ) -> Result<Vec<CheckpointTuple>> {
        let query_prefix = match checkpoint_ns {
            Some(ns) => format!("checkpoint#{}#", ns),
            None => "checkpoint#".to_string(),
        };
        let records = self
            .store
            .query_by_thread(thread_id, Some(&query_prefix))
            .await?;

        let shard_prefix = format!("{}#", self.config.split_record_prefix);
        let mut tuples = Vec::new();
        for record in records {
            if record.record_id.starts_with(&shard_prefix) {
                continue;
            }
            let Some(key) = parse_record_id(thread_id, &record.record_id) else {
                warn!(record_id = %record.record_id, "record_id 格式不可解析，跳过");
                continue;
            };

            if !record.is_split {
                match decode_plain(key, &record) {
                    Ok(tuple) => tuples.push(tuple),
                    Err(e) => {
                        warn!(record_id = %record.record_id, error = %e, "记录解码失败，跳过");
                    }
                }
                continue;
            }

            let result = self
                .reassembler
                .reassemble(
                    thread_id,
                    &record.record_id,
                    self.store.as_ref(),
                    &self.reassembly_options(),
                )
                .await?;
            match result.data {
                Some((checkpoint, metadata)) if result.success => {
                    tuples.push(CheckpointTuple {
                        key,
                        checkpoint,
                        metadata,
                    });
                }
                _ => {
                    warn!(
                        record_id = %record.record_id,
                        warnings = ?result.warnings,
                        "分片集重组失败，列表中跳过"
                    );
                }
            }
        }
        Ok(tuples)
    }

    /// 删除线程下的所有记录，包括辅助分片和宿主系统的其他簿记记录
    ///
    /// 逐条尽力删除；有失败时整体报错（报第一个失败），调用方可重试。
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let records = self.store.query_by_thread(thread_id, None).await?;
        let total = records.len();
        let mut first_err = None;
        for record in records {
            if let Err(e) = self.store.delete(thread_id, &record.record_id).await {
                warn!(record_id = %record.record_id, error = %e, "记录删除失败");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            } else {
                debug!(record_id = %record.record_id, "记录已删除");
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!(thread_id = %thread_id, records = total, "🗑️ 线程记录已清空");
                Ok(())
            }
        }
    }

    fn reassembly_options(&self) -> ReassemblyOptions {
        ReassemblyOptions {
            validate_checksums: true,
            timeout_ms: self.config.operation_timeout_ms,
            enable_logging: self.config.enable_size_monitoring,
        }
    }
}

// ── 私有工具函数 ──────────────────────────────────────────────────────────────

/// 解码一条未分片记录
fn decode_plain(key: CheckpointKey, record: &StoredRecord) -> Result<CheckpointTuple> {
    use crate::error::SerializationError;

    let checkpoint_json = record.checkpoint.as_deref().unwrap_or("{}");
    let metadata_json = record.metadata.as_deref().unwrap_or("{}");
    let checkpoint: Checkpoint = serde_json::from_str(checkpoint_json)
        .map_err(|e| SerializationError::Decode(e.to_string()))?;
    let metadata: Metadata = serde_json::from_str(metadata_json)
        .map_err(|e| SerializationError::Decode(e.to_string()))?;
    Ok(CheckpointTuple {
        key,
        checkpoint,
        metadata,
    })
}

/// 从排序键反解 `(ns, id)`：`"checkpoint#{ns}#{id}"`
fn parse_record_id(thread_id: &str, record_id: &str) -> Option<CheckpointKey> {
    let rest = record_id.strip_prefix("checkpoint#")?;
    let (ns, id) = rest.rsplit_once('#')?;
    Some(CheckpointKey::new(thread_id, ns, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SplitStrategy;
    use crate::store::InMemoryRecordStore;
    use serde_json::json;

    fn as_map(value: Value) -> Checkpoint {
        value.as_object().unwrap().clone()
    }

    fn large_checkpoint(count: usize) -> Checkpoint {
        let messages: Vec<Value> = (0..count)
            .map(|i| json!({ "role": "user", "index": i, "content": "z".repeat(560) }))
            .collect();
        as_map(json!({ "messages": { "messages": messages } }))
    }

    fn split_config(strategy: SplitStrategy) -> SplitConfig {
        SplitConfig {
            enabled: true,
            max_size_threshold: 10_000,
            strategy,
            max_chunk_size: 5_000,
            enable_size_monitoring: false,
            ..SplitConfig::default()
        }
    }

    fn store_with(config: SplitConfig) -> (Arc<InMemoryRecordStore>, CheckpointStore) {
        let backend = Arc::new(InMemoryRecordStore::new());
        let store = CheckpointStore::new(backend.clone(), config);
        (backend, store)
    }

    #[tokio::test]
    async fn small_record_is_stored_whole() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let key = CheckpointKey::new("t1", "", "ckpt-1");
        let checkpoint = as_map(json!({
            "messages": { "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"}
            ]}
        }));
        let metadata = as_map(json!({ "step": 1 }));

        let returned = store
            .put(&key, &checkpoint, &metadata, &ChannelVersions::new())
            .await
            .unwrap();
        assert_eq!(returned, key);
        assert_eq!(backend.record_count().await, 1);

        let raw = backend.get("t1", &key.record_id()).await.unwrap().unwrap();
        assert!(!raw.is_split);

        let tuple = store.get_tuple(&key).await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&tuple.checkpoint).unwrap(),
            serde_json::to_string(&checkpoint).unwrap()
        );
        assert_eq!(tuple.metadata["step"], json!(1));
    }

    #[tokio::test]
    async fn oversized_record_round_trips_through_shards() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let key = CheckpointKey::new("t1", "", "ckpt-1");
        let checkpoint = large_checkpoint(100);
        let metadata = as_map(json!({ "source": "loop" }));

        store
            .put(&key, &checkpoint, &metadata, &ChannelVersions::new())
            .await
            .unwrap();
        assert!(backend.record_count().await > 1);

        let tuple = store.get_tuple(&key).await.unwrap().unwrap();
        let restored = sizer::channel_messages(&tuple.checkpoint["messages"]).unwrap();
        assert_eq!(restored.len(), 100);
        // 消息保持原始顺序
        for (i, message) in restored.iter().enumerate() {
            assert_eq!(message["index"], json!(i));
        }
    }

    #[tokio::test]
    async fn threshold_boundary_is_strictly_greater() {
        let probe_checkpoint = as_map(json!({
            "messages": { "messages": [ {"role": "user", "content": "boundary probe"} ] }
        }));
        let metadata = as_map(json!({}));
        let analysis = sizer::analyze(
            &probe_checkpoint,
            &metadata,
            &SplitConfig::default(),
        )
        .unwrap();

        // total_size == threshold：不分片
        let config = SplitConfig {
            max_size_threshold: analysis.total_size,
            ..split_config(SplitStrategy::MessageLevel)
        };
        let (backend, store) = store_with(config);
        let key = CheckpointKey::new("t1", "", "ckpt-1");
        store
            .put(&key, &probe_checkpoint, &metadata, &ChannelVersions::new())
            .await
            .unwrap();
        assert_eq!(backend.record_count().await, 1);

        // total_size == threshold + 1：分片
        let config = SplitConfig {
            max_size_threshold: analysis.total_size - 1,
            ..split_config(SplitStrategy::MessageLevel)
        };
        let (backend, store) = store_with(config);
        store
            .put(&key, &probe_checkpoint, &metadata, &ChannelVersions::new())
            .await
            .unwrap();
        assert!(backend.record_count().await > 1);
    }

    #[tokio::test]
    async fn legacy_record_reads_without_reassembly() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        // 迁移前的历史记录：没有 isSplit 字段（反序列化后为 false）
        backend
            .create(StoredRecord::plain(
                "t1",
                "checkpoint#ns-a#old-1",
                "{\"ch\":{\"value\":1}}".to_string(),
                "{\"legacy\":true}".to_string(),
            ))
            .await
            .unwrap();

        let key = CheckpointKey::new("t1", "ns-a", "old-1");
        let tuple = store.get_tuple(&key).await.unwrap().unwrap();
        assert_eq!(tuple.metadata["legacy"], json!(true));
        assert_eq!(tuple.key.checkpoint_ns, "ns-a");
    }

    #[tokio::test]
    async fn get_tuple_degrades_to_none_on_broken_shard_set() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let key = CheckpointKey::new("t1", "", "ckpt-1");
        store
            .put(&key, &large_checkpoint(100), &as_map(json!({})), &ChannelVersions::new())
            .await
            .unwrap();

        // 删掉一个辅助分片制造损坏
        backend
            .delete("t1", "split#checkpoint##ckpt-1#part#0001")
            .await
            .unwrap();
        assert!(store.get_tuple(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_record_returns_none() {
        let (_backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let key = CheckpointKey::new("t1", "", "nope");
        assert!(store.get_tuple(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_hides_shards_and_reassembles() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let big = CheckpointKey::new("t1", "", "ckpt-big");
        store
            .put(&big, &large_checkpoint(100), &as_map(json!({})), &ChannelVersions::new())
            .await
            .unwrap();
        let small = CheckpointKey::new("t1", "", "ckpt-small");
        store
            .put(
                &small,
                &as_map(json!({ "messages": { "messages": [ {"role":"user","content":"hi"} ] } })),
                &as_map(json!({})),
                &ChannelVersions::new(),
            )
            .await
            .unwrap();
        assert!(backend.record_count().await > 2);

        let tuples = store.list("t1", None).await.unwrap();
        assert_eq!(tuples.len(), 2);
        // record_id 升序：ckpt-big 在 ckpt-small 之前
        assert_eq!(tuples[0].key.checkpoint_id, "ckpt-big");
        assert_eq!(tuples[1].key.checkpoint_id, "ckpt-small");
        // 分片集在列表里也是重组后的完整快照
        let restored = sizer::channel_messages(&tuples[0].checkpoint["messages"]).unwrap();
        assert_eq!(restored.len(), 100);
        // 不会出现辅助分片
        for tuple in &tuples {
            assert!(!tuple.key.checkpoint_id.contains("part"));
        }
    }

    #[tokio::test]
    async fn list_skips_broken_shard_sets() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let big = CheckpointKey::new("t1", "", "ckpt-big");
        store
            .put(&big, &large_checkpoint(100), &as_map(json!({})), &ChannelVersions::new())
            .await
            .unwrap();
        let small = CheckpointKey::new("t1", "", "ckpt-small");
        store
            .put(
                &small,
                &as_map(json!({ "ch": { "value": 1 } })),
                &as_map(json!({})),
                &ChannelVersions::new(),
            )
            .await
            .unwrap();

        backend
            .delete("t1", "split#checkpoint##ckpt-big#part#0001")
            .await
            .unwrap();

        let tuples = store.list("t1", None).await.unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].key.checkpoint_id, "ckpt-small");
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let (_backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        for (ns, id) in [("ns-a", "ckpt-1"), ("ns-a", "ckpt-2"), ("ns-b", "ckpt-3")] {
            store
                .put(
                    &CheckpointKey::new("t1", ns, id),
                    &as_map(json!({ "ch": { "value": 1 } })),
                    &as_map(json!({})),
                    &ChannelVersions::new(),
                )
                .await
                .unwrap();
        }
        let tuples = store.list("t1", Some("ns-a")).await.unwrap();
        assert_eq!(tuples.len(), 2);
        assert!(tuples.iter().all(|t| t.key.checkpoint_ns == "ns-a"));
    }

    #[tokio::test]
    async fn delete_thread_removes_shards_and_is_idempotent() {
        let (backend, store) = store_with(split_config(SplitStrategy::MessageLevel));
        let key = CheckpointKey::new("t1", "", "ckpt-1");
        store
            .put(&key, &large_checkpoint(100), &as_map(json!({})), &ChannelVersions::new())
            .await
            .unwrap();
        // 再放一条历史记录
        backend
            .create(StoredRecord::plain(
                "t1",
                "checkpoint##old",
                "{}".to_string(),
                "{}".to_string(),
            ))
            .await
            .unwrap();
        // 其他线程的数据不受影响
        backend
            .create(StoredRecord::plain(
                "t2",
                "checkpoint##other",
                "{}".to_string(),
                "{}".to_string(),
            ))
            .await
            .unwrap();

        let before = backend.record_count().await;
        assert!(before > 3);

        store.delete_thread("t1").await.unwrap();
        assert_eq!(backend.record_count().await, 1);
        assert!(backend.get("t2", "checkpoint##other").await.unwrap().is_some());

        // 幂等：再删一次结果不变
        store.delete_thread("t1").await.unwrap();
        assert_eq!(backend.record_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_puts_to_distinct_threads_both_land() {
        let backend = Arc::new(InMemoryRecordStore::new());
        let store = Arc::new(CheckpointStore::new(
            backend.clone(),
            split_config(SplitStrategy::MessageLevel),
        ));

        let key_a = CheckpointKey::new("thread-a", "", "ckpt-1");
        let key_b = CheckpointKey::new("thread-b", "", "ckpt-1");
        let store_a = store.clone();
        let store_b = store.clone();
        let ck_a = large_checkpoint(100);
        let ck_b = large_checkpoint(80);

        let (ra, rb) = tokio::join!(
            async {
                store_a
                    .put(&key_a, &ck_a, &as_map(json!({})), &ChannelVersions::new())
                    .await
            },
            async {
                store_b
                    .put(&key_b, &ck_b, &as_map(json!({})), &ChannelVersions::new())
                    .await
            },
        );
        ra.unwrap();
        rb.unwrap();

        let tuple_a = store.get_tuple(&key_a).await.unwrap().unwrap();
        let tuple_b = store.get_tuple(&key_b).await.unwrap().unwrap();
        assert_eq!(
            sizer::channel_messages(&tuple_a.checkpoint["messages"]).unwrap().len(),
            100
        );
        assert_eq!(
            sizer::channel_messages(&tuple_b.checkpoint["messages"]).unwrap().len(),
            80
        );
    }

    #[test]
    fn record_id_parsing_round_trips() {
        let key = CheckpointKey::new("t1", "ns-a", "1ef4f797-8335-6428");
        let parsed = parse_record_id("t1", &key.record_id()).unwrap();
        assert_eq!(parsed, key);

        let empty_ns = CheckpointKey::new("t1", "", "ckpt-1");
        let parsed = parse_record_id("t1", &empty_ns.record_id()).unwrap();
        assert_eq!(parsed, empty_ns);

        assert!(parse_record_id("t1", "writes#whatever").is_none());
    }
}

//! 写入路径：策略分片 + 重试/回滚写入
//!
//! 入口是 [`CheckpointSplitter::split_if_needed`]：先让 sizer 给出判定，
//! 需要分片时按配置的策略产出有序的分片记录，再逐个写入底层存储。
//! 任何一个分片在重试耗尽后仍失败，就回滚已写入的分片，保证
//! "要么分片集完整存在，要么一个都不存在"。

use crate::config::{SplitConfig, SplitStrategy};
use crate::error::{Result, SplitError, TimeoutError};
use crate::sizer;
use crate::split::{
    aux_record_id, ChunkCheckpointMetadata, ContentSplitData, MessageSplitData, SplitMetadata,
    SplitOutcome,
};
use crate::store::{Checkpoint, Metadata, RecordStore, StoredRecord};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// 重试退避的基数：第 n 次失败后睡 `2^(n-1) × 100ms`
const BACKOFF_BASE_MS: u64 = 100;

/// 分片写入协调器
pub struct CheckpointSplitter {
    config: SplitConfig,
}

impl CheckpointSplitter {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// 判定并执行分片写入
    ///
    /// 返回 `was_split = false` 时引擎没有写入任何记录，由调用方整条直写；
    /// 这包括分片被禁用、未超限、以及当前策略无法分片（如没有可切的消息）
    /// 三种情况。最后一种会落在直写路径上由存储自己拒绝超限记录，
    /// 引擎不做截断。
    pub async fn split_if_needed(
        &self,
        thread_id: &str,
        record_id: &str,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
        store: &dyn RecordStore,
    ) -> Result<SplitOutcome> {
        if !self.config.enabled {
            return Ok(pass_through(record_id));
        }

        let analysis = sizer::analyze(checkpoint, metadata, &self.config)?;
        if self.config.enable_size_monitoring {
            info!(
                record_id = %record_id,
                total_size = analysis.total_size,
                checkpoint_size = analysis.size_breakdown.checkpoint,
                metadata_size = analysis.size_breakdown.metadata,
                threshold = self.config.max_size_threshold,
                exceeds = analysis.exceeds_threshold,
                estimated_parts = analysis.estimated_parts,
                "📏 记录大小分析"
            );
        }
        if !analysis.exceeds_threshold {
            return Ok(pass_through(record_id));
        }

        let verdict = sizer::can_split(checkpoint, self.config.strategy);
        if !verdict.ok {
            warn!(
                record_id = %record_id,
                strategy = %self.config.strategy,
                reason = verdict.reason.as_deref().unwrap_or(""),
                "⚠️ 记录超限但无法分片，回退整条直写"
            );
            return Ok(pass_through(record_id));
        }

        let shards = self.perform_split(thread_id, record_id, checkpoint, metadata)?;
        if self.config.enable_size_monitoring {
            info!(
                record_id = %record_id,
                strategy = %self.config.strategy,
                parts = shards.len(),
                original_size = analysis.total_size,
                "✂️ 记录分片"
            );
        }
        let record_ids = self.store_shards(store, shards).await?;
        Ok(SplitOutcome {
            was_split: true,
            record_ids,
        })
    }

    /// 按配置的策略产出有序分片集
    fn perform_split(
        &self,
        thread_id: &str,
        record_id: &str,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<Vec<StoredRecord>> {
        match self.config.strategy {
            SplitStrategy::MessageLevel => {
                self.split_message_level(thread_id, record_id, checkpoint, metadata)
            }
            SplitStrategy::ContentLevel => {
                self.split_content_level(thread_id, record_id, checkpoint, metadata)
            }
        }
    }

    /// MESSAGE_LEVEL：按 channel 的消息序列切块
    ///
    /// 返回顺序是 `[主记录, 辅助1, 辅助2, …]`：主记录先写，
    /// 回滚时也先删，缩小"主记录可见但辅助缺失"的窗口。
    fn split_message_level(
        &self,
        thread_id: &str,
        record_id: &str,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<Vec<StoredRecord>> {
        let split_timestamp = chrono::Utc::now().to_rfc3339();

        let mut auxiliaries: Vec<StoredRecord> = Vec::new();
        let mut part_number: u32 = 1;
        let mut stripped = checkpoint.clone();

        for (channel_name, value) in checkpoint.iter() {
            let Some(messages) = sizer::channel_messages(value) else {
                continue;
            };
            if messages.is_empty() {
                continue;
            }
            let channel_version = value.as_object().and_then(|o| o.get("version")).cloned();
            let total_messages = messages.len();

            for (start, end) in chunk_ranges(messages, self.config.max_chunk_size as usize)? {
                let messages_data = sizer::to_canonical_json(&messages[start..end])?;
                let part_size = messages_data.len() as u64;
                let checksum = sizer::short_checksum(messages_data.as_bytes());

                auxiliaries.push(StoredRecord {
                    thread_id: thread_id.to_string(),
                    record_id: aux_record_id(
                        &self.config.split_record_prefix,
                        record_id,
                        part_number,
                    ),
                    checkpoint: None,
                    metadata: None,
                    is_split: true,
                    split_metadata: Some(SplitMetadata {
                        original_record_id: record_id.to_string(),
                        total_parts: 0, // 收尾时回填
                        part_number,
                        strategy: SplitStrategy::MessageLevel,
                        split_timestamp: split_timestamp.clone(),
                        original_size: 0, // 收尾时回填
                        part_size,
                        checksum: Some(checksum),
                    }),
                    message_split_data: Some(MessageSplitData {
                        channel_name: channel_name.clone(),
                        start_message_index: start,
                        end_message_index: end,
                        messages_data,
                        checkpoint_metadata: ChunkCheckpointMetadata {
                            total_messages,
                            channel_version: channel_version.clone(),
                        },
                    }),
                    content_split_data: None,
                });
                part_number += 1;
            }

            // 主记录的副本里清空该 channel 的消息，原 checkpoint 不动
            if let Some(obj) = stripped
                .get_mut(channel_name)
                .and_then(|v| v.as_object_mut())
            {
                obj.insert("messages".to_string(), json!([]));
            }
        }

        let checkpoint_json = sizer::to_canonical_json(&stripped)?;
        let metadata_json = sizer::to_canonical_json(metadata)?;
        let mut combined = checkpoint_json.clone().into_bytes();
        combined.extend_from_slice(metadata_json.as_bytes());
        // 清空消息后的主记录负载字节数，收尾时回填到整组分片
        let original_size = combined.len() as u64;

        let primary = StoredRecord {
            thread_id: thread_id.to_string(),
            record_id: record_id.to_string(),
            checkpoint: Some(checkpoint_json),
            metadata: Some(metadata_json),
            is_split: true,
            split_metadata: Some(SplitMetadata {
                original_record_id: record_id.to_string(),
                total_parts: 0,
                part_number: 0,
                strategy: SplitStrategy::MessageLevel,
                split_timestamp,
                original_size: 0,
                part_size: combined.len() as u64,
                checksum: Some(sizer::short_checksum(&combined)),
            }),
            message_split_data: None,
            content_split_data: None,
        };

        let mut shards = Vec::with_capacity(auxiliaries.len() + 1);
        shards.push(primary);
        shards.extend(auxiliaries);

        let total_parts = shards.len() as u32;
        for shard in &mut shards {
            if let Some(sm) = shard.split_metadata.as_mut() {
                sm.total_parts = total_parts;
                sm.original_size = original_size;
            }
        }
        Ok(shards)
    }

    /// CONTENT_LEVEL：整体序列化 + Base64 + 定长切块
    ///
    /// 第一块直接占用逻辑 record_id（序号 1），没有独立的骨架主记录。
    fn split_content_level(
        &self,
        thread_id: &str,
        record_id: &str,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<Vec<StoredRecord>> {
        let split_timestamp = chrono::Utc::now().to_rfc3339();

        let payload = json!({ "checkpoint": checkpoint, "metadata": metadata });
        let payload_json = sizer::to_canonical_json(&payload)?;
        let original_size = payload_json.len() as u64;
        let encoded = B64.encode(payload_json.as_bytes());

        let chunk_size = self.config.max_chunk_size as usize;
        let total_parts = encoded.len().div_ceil(chunk_size) as u32;

        let mut shards = Vec::with_capacity(total_parts as usize);
        for (i, start) in (0..encoded.len()).step_by(chunk_size).enumerate() {
            let part_number = i as u32 + 1;
            let end = (start + chunk_size).min(encoded.len());
            // Base64 串是纯 ASCII，按字节切不会切坏字符
            let chunk_data = encoded[start..end].to_string();

            shards.push(StoredRecord {
                thread_id: thread_id.to_string(),
                record_id: if part_number == 1 {
                    record_id.to_string()
                } else {
                    aux_record_id(&self.config.split_record_prefix, record_id, part_number)
                },
                checkpoint: None,
                metadata: None,
                is_split: true,
                split_metadata: Some(SplitMetadata {
                    original_record_id: record_id.to_string(),
                    total_parts,
                    part_number,
                    strategy: SplitStrategy::ContentLevel,
                    split_timestamp: split_timestamp.clone(),
                    original_size,
                    part_size: chunk_data.len() as u64,
                    checksum: Some(sizer::short_checksum(chunk_data.as_bytes())),
                }),
                message_split_data: None,
                content_split_data: Some(ContentSplitData {
                    chunk_data,
                    encoding: "base64".to_string(),
                }),
            });
        }
        Ok(shards)
    }

    /// 按产出顺序写入分片，指数退避重试，失败则回滚
    async fn store_shards(
        &self,
        store: &dyn RecordStore,
        shards: Vec<StoredRecord>,
    ) -> Result<Vec<String>> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.operation_timeout_ms);
        let mut written: Vec<(String, String)> = Vec::new();

        for shard in shards {
            let record_id = shard.record_id.clone();
            let mut attempts: u32 = 0;
            loop {
                if Instant::now() >= deadline {
                    self.rollback(store, &written).await;
                    return Err(TimeoutError::Write {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        timeout_ms: self.config.operation_timeout_ms,
                    }
                    .into());
                }
                match store.create(shard.clone()).await {
                    Ok(()) => {
                        debug!(record_id = %record_id, "💾 分片已写入");
                        written.push((shard.thread_id.clone(), record_id.clone()));
                        break;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= self.config.max_retries {
                            warn!(
                                record_id = %record_id,
                                attempts,
                                error = %e,
                                "❌ 分片写入重试耗尽，开始回滚"
                            );
                            self.rollback(store, &written).await;
                            return Err(SplitError::WriteExhausted {
                                record_id,
                                attempts,
                                cause: e.to_string(),
                            }
                            .into());
                        }
                        let backoff =
                            Duration::from_millis(BACKOFF_BASE_MS << (attempts - 1));
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        debug!(
                            record_id = %record_id,
                            attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            "分片写入失败，退避后重试"
                        );
                        sleep(backoff.min(remaining)).await;
                    }
                }
            }
        }

        Ok(written.into_iter().map(|(_, id)| id).collect())
    }

    /// 删除已写入的分片。删除失败只记日志，不能掩盖原始错误
    async fn rollback(&self, store: &dyn RecordStore, written: &[(String, String)]) {
        for (thread_id, record_id) in written {
            if let Err(e) = store.delete(thread_id, record_id).await {
                warn!(record_id = %record_id, error = %e, "⚠️ 回滚删除分片失败，忽略并继续");
            }
        }
    }
}

/// 贪心切块：超过 `max_chunk_size` 且当前块非空时封块
///
/// 返回半开区间 `[start, end)` 列表，保持原始顺序；
/// 单条超限的消息独占一块。
fn chunk_ranges(messages: &[Value], max_chunk_size: usize) -> Result<Vec<(usize, usize)>> {
    let mut ranges = Vec::new();
    let mut chunk_start = 0usize;
    let mut chunk_bytes = 0usize;

    for (i, message) in messages.iter().enumerate() {
        let message_bytes = sizer::to_canonical_json(message)?.len();
        if chunk_bytes + message_bytes > max_chunk_size && i > chunk_start {
            ranges.push((chunk_start, i));
            chunk_start = i;
            chunk_bytes = 0;
        }
        chunk_bytes += message_bytes;
    }
    if chunk_start < messages.len() {
        ranges.push((chunk_start, messages.len()));
    }
    Ok(ranges)
}

fn pass_through(record_id: &str) -> SplitOutcome {
    SplitOutcome {
        was_split: false,
        record_ids: vec![record_id.to_string()],
    }
}

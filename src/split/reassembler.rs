//! 读取路径：在 deadline 内收集分片并重组出原始记录
//!
//! 重组永远不抛错：步骤内的任何失败（缺片、校验不过、负载损坏、超时）
//! 都折叠成 `success = false` 加 `warnings` 的结构化结果，
//! 由 Storage Adapter 决定对调用方的呈现方式（通常按"记录不存在"降级）。
//! 只有第一步读主记录时的存储错误会按原样向上传播。

use crate::config::{SplitConfig, SplitStrategy};
use crate::error::{ChecksumError, Result, TimeoutError};
use crate::sizer;
use crate::split::{aux_record_id, ReassemblyOptions, ReassemblyResult};
use crate::store::{Checkpoint, Metadata, RecordStore, StoredRecord};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 分片重组器
pub struct CheckpointReassembler {
    config: SplitConfig,
}

impl CheckpointReassembler {
    pub fn new(config: SplitConfig) -> Self {
        Self { config }
    }

    /// 从分片集重组逻辑记录
    pub async fn reassemble(
        &self,
        thread_id: &str,
        record_id: &str,
        store: &dyn RecordStore,
        options: &ReassemblyOptions,
    ) -> Result<ReassemblyResult> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(options.timeout_ms);
        let mut warnings: Vec<String> = Vec::new();

        let Some(primary) = store.get(thread_id, record_id).await? else {
            return Ok(ReassemblyResult::failure(
                vec!["Record not found".to_string()],
                elapsed_ms(started),
                0,
                0,
            ));
        };
        if !primary.is_split {
            return Ok(ReassemblyResult::failure(
                vec!["Record is not split".to_string()],
                elapsed_ms(started),
                0,
                0,
            ));
        }
        let Some(sm) = primary.split_metadata.clone() else {
            return Ok(ReassemblyResult::failure(
                vec!["Reassembly failed: invalid split metadata".to_string()],
                elapsed_ms(started),
                0,
                0,
            ));
        };

        let total_parts = sm.total_parts;
        let strategy = sm.strategy;

        // 收集辅助分片。策略不同，辅助序号的区间也不同：
        // MESSAGE_LEVEL 的主记录是 part 0，辅助为 1..N-1；
        // CONTENT_LEVEL 的 part 1 就是主记录本身，辅助为 2..N。
        let aux_numbers: Vec<u32> = match strategy {
            SplitStrategy::MessageLevel => (1..total_parts).collect(),
            SplitStrategy::ContentLevel => (2..=total_parts).collect(),
        };

        let mut parts: Vec<StoredRecord> = vec![primary];
        for n in aux_numbers {
            let aux_key = aux_record_id(&self.config.split_record_prefix, record_id, n);
            match store.get(thread_id, &aux_key).await {
                Ok(Some(part)) => {
                    if options.enable_logging {
                        debug!(record_id = %aux_key, part = n, "🧩 已取得分片");
                    }
                    parts.push(part);
                }
                Ok(None) => {
                    if options.enable_logging {
                        debug!(record_id = %aux_key, part = n, "分片缺失");
                    }
                }
                Err(e) => {
                    warnings.push(format!("Store error fetching part {}: {}", n, e));
                }
            }
            if Instant::now() >= deadline {
                let timeout = TimeoutError::Reassembly {
                    elapsed_ms: elapsed_ms(started),
                    timeout_ms: options.timeout_ms,
                };
                warn!(record_id = %record_id, "⏱️ {}", timeout);
                warnings.push(timeout.to_string());
                return Ok(ReassemblyResult::failure(
                    warnings,
                    elapsed_ms(started),
                    parts.len() as u32,
                    total_parts,
                ));
            }
        }

        if (parts.len() as u32) < total_parts {
            warnings.push(format!("Found {}/{} parts", parts.len(), total_parts));
        }
        parts.sort_by_key(|p| {
            p.split_metadata
                .as_ref()
                .map(|m| m.part_number)
                .unwrap_or(u32::MAX)
        });

        let found = parts.len() as u32;
        let outcome = match strategy {
            SplitStrategy::MessageLevel => {
                reassemble_message_level(&parts, total_parts, options)
            }
            SplitStrategy::ContentLevel => {
                reassemble_content_level(&parts, total_parts, options)
            }
        };

        match outcome {
            Ok(data) => {
                if options.enable_logging {
                    info!(
                        record_id = %record_id,
                        parts = found,
                        elapsed_ms = elapsed_ms(started),
                        "♻️ 记录重组完成"
                    );
                }
                Ok(ReassemblyResult {
                    success: true,
                    data: Some(data),
                    warnings,
                    reassembly_time_ms: elapsed_ms(started),
                    parts_reassembled: found,
                    total_expected_parts: total_parts,
                })
            }
            Err(reason) => {
                warnings.push(reason);
                Ok(ReassemblyResult::failure(
                    warnings,
                    elapsed_ms(started),
                    found,
                    total_parts,
                ))
            }
        }
    }
}

// ── 各策略的重组 ──────────────────────────────────────────────────────────────

type ReassembleOutcome = std::result::Result<(Checkpoint, Metadata), String>;

/// MESSAGE_LEVEL：解析主记录骨架，把各辅助分片的消息按序写回对应 channel
fn reassemble_message_level(
    parts: &[StoredRecord],
    total_parts: u32,
    options: &ReassemblyOptions,
) -> ReassembleOutcome {
    if (parts.len() as u32) < total_parts {
        return Err(format!(
            "Reassembly failed: expected {} parts, found {}",
            total_parts,
            parts.len()
        ));
    }
    let primary = parts
        .iter()
        .find(|p| {
            p.split_metadata
                .as_ref()
                .map(|m| m.part_number == 0)
                .unwrap_or(false)
        })
        .ok_or_else(|| "Reassembly failed: primary part missing".to_string())?;

    let checkpoint_json = primary
        .checkpoint
        .as_ref()
        .ok_or_else(|| "Reassembly failed: primary has no checkpoint payload".to_string())?;
    let metadata_json = primary
        .metadata
        .as_ref()
        .ok_or_else(|| "Reassembly failed: primary has no metadata payload".to_string())?;
    let mut checkpoint: Checkpoint = serde_json::from_str(checkpoint_json)
        .map_err(|e| format!("Reassembly failed: corrupt primary checkpoint: {}", e))?;
    let metadata: Metadata = serde_json::from_str(metadata_json)
        .map_err(|e| format!("Reassembly failed: corrupt primary metadata: {}", e))?;

    // 分片已按 part_number 排好序，逐 channel 聚合即可保持原始消息顺序
    let mut channels: Vec<(String, Vec<Value>)> = Vec::new();
    for part in parts {
        let Some(sm) = part.split_metadata.as_ref() else {
            continue;
        };
        if sm.part_number == 0 {
            continue;
        }
        let msd = part.message_split_data.as_ref().ok_or_else(|| {
            format!(
                "Reassembly failed: part {} has no message payload",
                sm.part_number
            )
        })?;

        if options.validate_checksums {
            verify_checksum(sm.part_number, sm.checksum.as_deref(), &msd.messages_data)?;
        }

        let mut messages: Vec<Value> = serde_json::from_str(&msd.messages_data)
            .map_err(|e| format!("Reassembly failed: corrupt part {}: {}", sm.part_number, e))?;
        match channels.iter_mut().find(|(name, _)| name == &msd.channel_name) {
            Some((_, acc)) => acc.append(&mut messages),
            None => channels.push((msd.channel_name.clone(), messages)),
        }
    }

    for (name, messages) in channels {
        let slot = checkpoint
            .get_mut(&name)
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| format!("Reassembly failed: channel {} missing from primary", name))?;
        slot.insert("messages".to_string(), Value::Array(messages));
    }
    Ok((checkpoint, metadata))
}

/// CONTENT_LEVEL：按序拼接 Base64 块，解码后反序列化出 `{checkpoint, metadata}`
fn reassemble_content_level(
    parts: &[StoredRecord],
    total_parts: u32,
    options: &ReassemblyOptions,
) -> ReassembleOutcome {
    if (parts.len() as u32) < total_parts {
        return Err(format!(
            "Reassembly failed: expected {} parts, found {}",
            total_parts,
            parts.len()
        ));
    }

    let mut encoded = String::new();
    for part in parts {
        let Some(sm) = part.split_metadata.as_ref() else {
            return Err("Reassembly failed: invalid split metadata".to_string());
        };
        let csd = part.content_split_data.as_ref().ok_or_else(|| {
            format!(
                "Reassembly failed: part {} has no content payload",
                sm.part_number
            )
        })?;
        if options.validate_checksums {
            verify_checksum(sm.part_number, sm.checksum.as_deref(), &csd.chunk_data)?;
        }
        encoded.push_str(&csd.chunk_data);
    }

    let decoded = B64
        .decode(encoded.as_bytes())
        .map_err(|e| format!("Reassembly failed: invalid base64 payload: {}", e))?;
    let payload: Value = serde_json::from_slice(&decoded)
        .map_err(|e| format!("Reassembly failed: corrupt payload: {}", e))?;

    let checkpoint = payload
        .get("checkpoint")
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| "Reassembly failed: payload has no checkpoint".to_string())?;
    let metadata = payload
        .get("metadata")
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| "Reassembly failed: payload has no metadata".to_string())?;
    Ok((checkpoint, metadata))
}

/// 重算分片负载的短校验和并与记录值比对
fn verify_checksum(
    part_number: u32,
    expected: Option<&str>,
    payload: &str,
) -> std::result::Result<(), String> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = sizer::short_checksum(payload.as_bytes());
    if actual != expected {
        return Err(ChecksumError::Mismatch {
            part_number,
            expected: expected.to_string(),
            actual,
        }
        .to_string());
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::CheckpointSplitter;
    use crate::store::InMemoryRecordStore;
    use crate::testing::MockRecordStore;
    use serde_json::json;

    fn as_map(value: Value) -> Checkpoint {
        value.as_object().unwrap().clone()
    }

    fn test_config(strategy: SplitStrategy) -> SplitConfig {
        SplitConfig {
            enabled: true,
            max_size_threshold: 10_000,
            strategy,
            max_chunk_size: 5_000,
            enable_size_monitoring: false,
            split_record_prefix: "split".to_string(),
            max_retries: 3,
            operation_timeout_ms: 30_000,
        }
    }

    fn large_checkpoint(count: usize) -> Checkpoint {
        let messages: Vec<Value> = (0..count)
            .map(|i| json!({ "role": "assistant", "index": i, "content": "y".repeat(560) }))
            .collect();
        as_map(json!({
            "messages": { "messages": messages, "version": 1 },
            "counter": { "value": 7 }
        }))
    }

    async fn split_into(
        store: &dyn RecordStore,
        config: &SplitConfig,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Vec<String> {
        let splitter = CheckpointSplitter::new(config.clone());
        let outcome = splitter
            .split_if_needed("t1", "checkpoint#ns#1", checkpoint, metadata, store)
            .await
            .unwrap();
        assert!(outcome.was_split);
        outcome.record_ids
    }

    #[tokio::test]
    async fn message_level_round_trip_preserves_order() {
        let store = InMemoryRecordStore::new();
        let config = test_config(SplitStrategy::MessageLevel);
        let checkpoint = large_checkpoint(100);
        let metadata = as_map(json!({ "step": 42 }));
        split_into(&store, &config, &checkpoint, &metadata).await;

        let reassembler = CheckpointReassembler::new(config);
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(result.success, "warnings: {:?}", result.warnings);
        assert_eq!(result.parts_reassembled, result.total_expected_parts);

        let (got_checkpoint, got_metadata) = result.data.unwrap();
        // 规范序列化后逐字节一致
        assert_eq!(
            serde_json::to_string(&got_checkpoint).unwrap(),
            serde_json::to_string(&checkpoint).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&got_metadata).unwrap(),
            serde_json::to_string(&metadata).unwrap()
        );
    }

    #[tokio::test]
    async fn content_level_round_trip_is_byte_equal() {
        let store = InMemoryRecordStore::new();
        let config = test_config(SplitStrategy::ContentLevel);
        let checkpoint = large_checkpoint(60);
        let metadata = as_map(json!({ "writes": {"a": 1}, "source": "loop" }));
        let ids = split_into(&store, &config, &checkpoint, &metadata).await;
        assert!(ids.len() >= 2);

        let reassembler = CheckpointReassembler::new(config);
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(result.success, "warnings: {:?}", result.warnings);
        let (got_checkpoint, got_metadata) = result.data.unwrap();
        assert_eq!(
            serde_json::to_string(&got_checkpoint).unwrap(),
            serde_json::to_string(&checkpoint).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&got_metadata).unwrap(),
            serde_json::to_string(&metadata).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_auxiliary_fails_with_parts_warning() {
        let store = InMemoryRecordStore::new();
        let config = test_config(SplitStrategy::MessageLevel);
        let checkpoint = large_checkpoint(100);
        let ids = split_into(&store, &config, &checkpoint, &as_map(json!({}))).await;
        let total = ids.len();

        // 模拟一个辅助分片事后丢失
        store.delete("t1", &ids[1]).await.unwrap();

        let reassembler = CheckpointReassembler::new(config);
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        let expected = format!("Found {}/{} parts", total - 1, total);
        assert!(
            result.warnings.iter().any(|w| w == &expected),
            "warnings: {:?}",
            result.warnings
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_when_validation_enabled() {
        let store = InMemoryRecordStore::new();
        let config = test_config(SplitStrategy::MessageLevel);
        let checkpoint = large_checkpoint(100);
        let ids = split_into(&store, &config, &checkpoint, &as_map(json!({}))).await;

        // 篡改第一个辅助分片的负载（保持 JSON 合法）
        let mut corrupted = store.get("t1", &ids[1]).await.unwrap().unwrap();
        corrupted.message_split_data.as_mut().unwrap().messages_data =
            "[{\"role\":\"assistant\",\"content\":\"tampered\"}]".to_string();
        store.create(corrupted).await.unwrap();

        let reassembler = CheckpointReassembler::new(config);
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.starts_with("Checksum mismatch in part 1")),
            "warnings: {:?}",
            result.warnings
        );

        // 关闭校验时照常重组（内容已被篡改，但这是调用方的选择）
        let relaxed = ReassemblyOptions {
            validate_checksums: false,
            ..ReassemblyOptions::default()
        };
        let result = CheckpointReassembler::new(test_config(SplitStrategy::MessageLevel))
            .reassemble("t1", "checkpoint#ns#1", &store, &relaxed)
            .await
            .unwrap();
        assert!(result.success, "warnings: {:?}", result.warnings);
    }

    #[tokio::test]
    async fn absent_record_reports_not_found() {
        let store = InMemoryRecordStore::new();
        let reassembler = CheckpointReassembler::new(test_config(SplitStrategy::MessageLevel));
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#nope", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.warnings, vec!["Record not found".to_string()]);
    }

    #[tokio::test]
    async fn unsplit_record_is_not_reassembled() {
        let store = InMemoryRecordStore::new();
        store
            .create(StoredRecord::plain(
                "t1",
                "checkpoint#ns#1",
                "{}".to_string(),
                "{}".to_string(),
            ))
            .await
            .unwrap();
        let reassembler = CheckpointReassembler::new(test_config(SplitStrategy::MessageLevel));
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.warnings, vec!["Record is not split".to_string()]);
    }

    #[tokio::test]
    async fn split_flag_without_metadata_is_invalid() {
        let store = InMemoryRecordStore::new();
        let mut record =
            StoredRecord::plain("t1", "checkpoint#ns#1", "{}".to_string(), "{}".to_string());
        record.is_split = true;
        store.create(record).await.unwrap();

        let reassembler = CheckpointReassembler::new(test_config(SplitStrategy::MessageLevel));
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &ReassemblyOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.warnings,
            vec!["Reassembly failed: invalid split metadata".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gather_respects_deadline() {
        let store = MockRecordStore::new().with_get_delay(Duration::from_millis(100));
        let config = test_config(SplitStrategy::MessageLevel);
        {
            let splitter = CheckpointSplitter::new(config.clone());
            splitter
                .split_if_needed(
                    "t1",
                    "checkpoint#ns#1",
                    &large_checkpoint(100),
                    &as_map(json!({})),
                    &store,
                )
                .await
                .unwrap();
        }

        let options = ReassemblyOptions {
            timeout_ms: 150,
            ..ReassemblyOptions::default()
        };
        let reassembler = CheckpointReassembler::new(config);
        let result = reassembler
            .reassemble("t1", "checkpoint#ns#1", &store, &options)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.starts_with("Reassembly timed out")),
            "warnings: {:?}",
            result.warnings
        );
        // 没有收齐就超时了
        assert!(result.parts_reassembled < result.total_expected_parts);
    }
}

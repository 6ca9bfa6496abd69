//! 进程内存 RecordStore，适合测试和短生命周期使用

use crate::error::Result;
use crate::store::{RecordStore, StoredRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// 基于 `HashMap<thread_id, BTreeMap<record_id, _>>` 的内存实现
///
/// 内层用 `BTreeMap`，`query_by_thread` 天然按 `record_id` 升序返回。
pub struct InMemoryRecordStore {
    data: RwLock<HashMap<String, BTreeMap<String, StoredRecord>>>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// 当前存储的记录总数（跨所有线程），测试用
    pub async fn record_count(&self) -> usize {
        self.data.read().await.values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, thread_id: &str, record_id: &str) -> Result<Option<StoredRecord>> {
        Ok(self
            .data
            .read()
            .await
            .get(thread_id)
            .and_then(|m| m.get(record_id))
            .cloned())
    }

    async fn create(&self, record: StoredRecord) -> Result<()> {
        self.data
            .write()
            .await
            .entry(record.thread_id.clone())
            .or_default()
            .insert(record.record_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, thread_id: &str, record_id: &str) -> Result<()> {
        if let Some(m) = self.data.write().await.get_mut(thread_id) {
            m.remove(record_id);
        }
        Ok(())
    }

    async fn query_by_thread(
        &self,
        thread_id: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StoredRecord>> {
        let data = self.data.read().await;
        let Some(m) = data.get(thread_id) else {
            return Ok(vec![]);
        };
        Ok(m.values()
            .filter(|r| {
                key_prefix
                    .map(|p| r.record_id.starts_with(p))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

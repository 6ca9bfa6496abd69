//! Mock RecordStore，用于在不依赖真实 KV 后端的情况下测试分片引擎。
//!
//! 典型用途：
//! - 给指定 record_id 注入写入失败，测试重试与回滚路径
//! - 注入删除失败，测试回滚吞错和 `delete_thread` 的容错
//! - 给读取加人工延迟，测试重组的 deadline 行为
//!
//! # 示例
//!
//! ```rust
//! use echo_checkpoint::testing::MockRecordStore;
//! use echo_checkpoint::store::{RecordStore, StoredRecord};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = MockRecordStore::new().with_create_failures("checkpoint#ns#1", 2);
//!
//! let record = StoredRecord::plain("t1", "checkpoint#ns#1", "{}".into(), "{}".into());
//! assert!(store.create(record.clone()).await.is_err()); // 第一次失败
//! assert!(store.create(record.clone()).await.is_err()); // 第二次失败
//! assert!(store.create(record).await.is_ok());          // 之后成功
//! assert_eq!(store.create_call_count(), 3);
//! # }
//! ```

use crate::error::{Result, StoreError};
use crate::store::{InMemoryRecordStore, RecordStore, StoredRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 可脚本化的 Mock RecordStore
///
/// 内部委托给一个 [`InMemoryRecordStore`]，在其之上叠加失败注入与调用记录。
/// 所有调用都被记录，可通过 [`create_call_count`](MockRecordStore::create_call_count) /
/// [`delete_calls`](MockRecordStore::delete_calls) 等方法检查。
pub struct MockRecordStore {
    inner: InMemoryRecordStore,
    /// record_id → 剩余的 create 失败次数
    create_failures: Mutex<HashMap<String, u32>>,
    /// record_id → 剩余的 delete 失败次数
    delete_failures: Mutex<HashMap<String, u32>>,
    /// 每次 get 前的人工延迟
    get_delay: Mutex<Option<Duration>>,
    create_calls: Mutex<Vec<String>>,
    delete_calls: Mutex<Vec<String>>,
    get_calls: Mutex<Vec<String>>,
}

impl Default for MockRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRecordStore {
    /// 创建空 Mock，尚未注入任何失败
    pub fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            create_failures: Mutex::new(HashMap::new()),
            delete_failures: Mutex::new(HashMap::new()),
            get_delay: Mutex::new(None),
            create_calls: Mutex::new(Vec::new()),
            delete_calls: Mutex::new(Vec::new()),
            get_calls: Mutex::new(Vec::new()),
        }
    }

    /// 让指定 record_id 的前 `times` 次 create 失败（`u32::MAX` 表示永远失败）
    pub fn with_create_failures(self, record_id: impl Into<String>, times: u32) -> Self {
        self.create_failures
            .lock()
            .unwrap()
            .insert(record_id.into(), times);
        self
    }

    /// 让指定 record_id 的前 `times` 次 delete 失败
    pub fn with_delete_failures(self, record_id: impl Into<String>, times: u32) -> Self {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(record_id.into(), times);
        self
    }

    /// 每次 get 前睡指定时长，配合 paused clock 测试 deadline
    pub fn with_get_delay(self, delay: Duration) -> Self {
        *self.get_delay.lock().unwrap() = Some(delay);
        self
    }

    /// 已发生的 create 调用总次数（含失败的）
    pub fn create_call_count(&self) -> usize {
        self.create_calls.lock().unwrap().len()
    }

    /// 已发生的 get 调用总次数
    pub fn get_call_count(&self) -> usize {
        self.get_calls.lock().unwrap().len()
    }

    /// 所有 create 调用的 record_id，按时序排列
    pub fn create_calls(&self) -> Vec<String> {
        self.create_calls.lock().unwrap().clone()
    }

    /// 所有 delete 调用的 record_id，按时序排列
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    /// 若注入表中还有剩余失败次数则消耗一次并返回 true
    fn consume_failure(table: &Mutex<HashMap<String, u32>>, record_id: &str) -> bool {
        let mut table = table.lock().unwrap();
        match table.get_mut(record_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RecordStore for MockRecordStore {
    async fn get(&self, thread_id: &str, record_id: &str) -> Result<Option<StoredRecord>> {
        self.get_calls.lock().unwrap().push(record_id.to_string());
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get(thread_id, record_id).await
    }

    async fn create(&self, record: StoredRecord) -> Result<()> {
        self.create_calls
            .lock()
            .unwrap()
            .push(record.record_id.clone());
        if Self::consume_failure(&self.create_failures, &record.record_id) {
            return Err(StoreError::Backend("injected create failure".to_string()).into());
        }
        self.inner.create(record).await
    }

    async fn delete(&self, thread_id: &str, record_id: &str) -> Result<()> {
        self.delete_calls
            .lock()
            .unwrap()
            .push(record_id.to_string());
        if Self::consume_failure(&self.delete_failures, record_id) {
            return Err(StoreError::Backend("injected delete failure".to_string()).into());
        }
        self.inner.delete(thread_id, record_id).await
    }

    async fn query_by_thread(
        &self,
        thread_id: &str,
        key_prefix: Option<&str>,
    ) -> Result<Vec<StoredRecord>> {
        self.inner.query_by_thread(thread_id, key_prefix).await
    }
}

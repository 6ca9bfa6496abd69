//! 测试基础设施
//!
//! 提供在不依赖真实 KV 后端的情况下测试分片引擎各组件的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockRecordStore`] | 替代真实存储，注入写入/删除失败与读取延迟 |
//!
//! # 设计原则
//!
//! - **零外部依赖**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_create_failures()` / `with_get_delay()` 精确控制行为
//! - **可观测**：通过 `create_call_count()` / `delete_calls()` 等方法检查调用情况
//! - **线程安全**：内部使用 `Mutex`，可安全地在多任务测试中共享
//!
//! # 使用示例
//!
//! 测试"第 3 个分片写入失败后整组回滚"：
//!
//! ```rust,no_run
//! use echo_checkpoint::testing::MockRecordStore;
//! use echo_checkpoint::split::CheckpointSplitter;
//! use echo_checkpoint::config::SplitConfig;
//!
//! # async fn example() {
//! let store = MockRecordStore::new()
//!     .with_create_failures("split#checkpoint#ns#1#part#0002", u32::MAX);
//! let splitter = CheckpointSplitter::new(SplitConfig::default());
//! // split_if_needed(...) 会在重试耗尽后回滚并返回 SplitError
//! # }
//! ```

pub mod mock_store;

pub use mock_store::MockRecordStore;

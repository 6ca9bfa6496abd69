pub mod checkpointer;
pub mod config;
pub mod error;
pub mod sizer;
pub mod split;
pub mod store;
pub mod testing;

pub mod prelude {
    pub use crate::checkpointer::{ChannelVersions, CheckpointKey, CheckpointStore, CheckpointTuple};
    pub use crate::config::{SplitConfig, SplitStrategy};
    pub use crate::error::Result;
    pub use crate::store::{InMemoryRecordStore, RecordStore, StoredRecord};
}

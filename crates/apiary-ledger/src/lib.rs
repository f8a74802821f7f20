pub mod lineage;
pub mod lock;
pub mod paths;
pub mod segment;
pub mod store;
pub mod verify;

pub use lineage::{Direction, LineageIndex, LineageResult};
pub use lock::RetryPolicy;
pub use paths::ApiaryPaths;
pub use store::{EventStore, Replay, SegmentWriter};
pub use verify::{ChainBreak, ChainReport};

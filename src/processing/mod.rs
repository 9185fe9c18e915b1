pub mod dispatcher;
pub mod groups;
pub mod snapshot;
pub mod spectrum;

pub use dispatcher::Dispatcher;
pub use groups::{Admission, EventRecord, EventRegistry, GroupMembers, IgnoredTrigger, AVERAGE};
pub use snapshot::{Snapshot, SnapshotEngine, SnapshotSettings, SnapshotStage};

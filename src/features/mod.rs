pub mod live_sequence;
pub mod sequence_watcher;
pub mod watch_registry;

pub use live_sequence::LiveSequence;
pub use sequence_watcher::{
    AppendEvent, AppendHandler, Disposer, SequenceTarget, SequenceWatcher, StrategyKind,
    WatchedSequence,
};
pub use watch_registry::{SequenceIdentity, Signature, WatchRegistry};

pub mod channel_merger;
pub mod network;
pub mod paginator;

pub use channel_merger::{ChannelMerger, ContentPriority, MergeOutput, MergePolicy};
pub use network::{NetworkBuffer, NetworkChannel, NetworkDecoder, NetworkRecord, RawResponse};
pub use paginator::{CumulativeSet, PaginationPolicy, Paginator};

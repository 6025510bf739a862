pub mod core;
pub mod extraction;
pub mod features;
pub mod harvest;
pub mod scraping;
pub mod sync;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::{HarvestConfig, HarvestError, HarvestResult, NetworkDecodeError, WatchError};
pub use core::{CaptureRequest, PageDriver, ScrollEdge};

pub use harvest::{HarvestReport, Harvester, InitSummary, LocalSequences, SequenceSource};

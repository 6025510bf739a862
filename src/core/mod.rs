pub mod config;
pub mod error;
pub mod sandbox;
pub mod types;

pub use config::HarvestConfig;
pub use error::{HarvestError, HarvestResult, NetworkDecodeError, WatchError};
pub use sandbox::{CaptureRequest, PageDriver, ScrollEdge};

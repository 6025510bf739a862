pub mod record_extractor;
pub mod record_shape;
pub mod snapshot;
pub mod store_locator;
pub mod tree_walker;

pub use record_extractor::{Extraction, ExtractorOptions, RecordExtractor};
pub use record_shape::{Classifier, RawFields, RecordCandidate, RecordKeys, ShapeMatch};
pub use snapshot::{DocumentView, PageSnapshot, RenderTree, StateSlot};
pub use store_locator::{LocatedStore, LocatorOptions, StoreLocator, StoreStart};

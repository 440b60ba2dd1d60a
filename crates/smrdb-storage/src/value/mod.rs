//! Out-of-line value storage
//!
//! Large values live in dedicated value files instead of the tables. The
//! builder writes them, the deleter accounts for dropped references, and the
//! mover empties fragmented files so their zones can be reclaimed.

mod builder;
mod deleter;
mod mover;
pub mod section;
mod store;

pub use builder::{SECTION_INDEX_LIMIT, ValueBuilder};
pub use deleter::ValueDeleter;
pub use mover::{MoveStats, ValueMover};
pub use section::{IndexEntry, SectionDescriptor};
pub use store::{ExternalComparator, ExternalLocator, MemValueStore, PutOutcome, StoredValue, ValueStore};

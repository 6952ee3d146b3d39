//! Storage layer: the draft, catalog, and audit contracts the reconciliation
//! engine consumes, with in-memory and DuckDB implementations.

mod error;
pub use error::StoreError;

mod traits;
pub use traits::{CatalogStore, DraftFilter, DraftOrder, DraftPatch, DraftStore, DraftTransaction};

mod memory;
pub use memory::{MemoryCatalog, MemoryStore};

mod seed;
pub use seed::Seed;

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckStore;

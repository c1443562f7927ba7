pub mod algo;
pub mod config;
pub mod error;
pub mod ops;
pub mod pipeline;
pub mod record;

#[cfg(feature = "mcp")]
pub mod mcp;

pub use config::DedupConfig;
pub use error::{DedupError, Result};
pub use pipeline::{dedup_documents, DedupPlan, DedupStats, Pipeline};
pub use record::{Document, DocumentSink, DocumentSource};

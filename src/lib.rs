//! Comic archive ingestion and page rendering.
//!
//! Detects container formats, extracts and validates member images, exposes
//! any source as a randomly addressable page sequence with a bounded page
//! cache, indexes per-page text for search and imports metadata in batches.

pub mod archive;
pub mod config;
pub mod error;
pub mod identity;
pub mod import;
pub mod pages;
pub mod pool;
pub mod text;

pub use archive::{
    detect_archive_format, extract_archive, extract_archive_async, get_archive_info,
    ArchiveFormat, ArchiveInfo, ExtractionResult,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use import::{ComicMetadata, ImportPipeline, ImportQueue, Priority};
pub use pages::{open_page_provider, PageCache, PageProvider};
pub use text::{SearchState, TextIndex};

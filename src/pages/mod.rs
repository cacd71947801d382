pub mod cache;
pub mod providers;

use image::{DynamicImage, ImageReader};
use std::cmp::Ordering;
use std::io::Cursor;
use std::path::Path;

use crate::archive::{detect_document_kind, ArchiveFormat, DocumentKind};
use crate::config::EngineConfig;
use crate::error::{Error, Result};

pub use cache::{CacheStats, PageCache};
pub use providers::{ContainerPageProvider, DirectoryPageProvider, DocumentPageProvider};

/// Random access to the pages of one source.
///
/// `page_count` is fixed for the provider's lifetime. Any failure, including
/// an index outside `0..page_count`, comes back as `None`.
pub trait PageProvider: Send + Sync {
    fn page_count(&self) -> usize;

    fn get_page(&self, index: usize) -> Option<DynamicImage>;

    /// Scaled copy of a page fitting in `max_edge` on both sides. Not cached.
    fn get_thumbnail(&self, index: usize, max_edge: u32) -> Option<DynamicImage> {
        self.get_page(index)
            .map(|page| page.thumbnail(max_edge, max_edge))
    }

    /// Source name of every page in page order: the archive entry name for
    /// containers, the file name for folders. Empty for rendered documents.
    fn page_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn kind(&self) -> &'static str;
}

/// Pick and open the provider for `path`. Failures are logged and yield `None`.
pub fn open_page_provider(
    path: &Path,
    password: Option<&str>,
    config: &EngineConfig,
) -> Option<Box<dyn PageProvider>> {
    match try_open_page_provider(path, password, config) {
        Ok(provider) => {
            log::debug!(
                "Opened {} provider for {} ({} pages)",
                provider.kind(),
                path.display(),
                provider.page_count()
            );
            Some(provider)
        }
        Err(e) => {
            log::warn!("Failed to open pages of {}: {e}", path.display());
            None
        }
    }
}

/// [`open_page_provider`] on a blocking worker, bounded by the open timeout.
pub async fn open_page_provider_async(
    path: &Path,
    password: Option<String>,
    config: &EngineConfig,
) -> Option<Box<dyn PageProvider>> {
    let timeout = config.timeouts.open();
    let owned_path = path.to_path_buf();
    let owned_config = config.clone();
    let task = tokio::task::spawn_blocking(move || {
        open_page_provider(&owned_path, password.as_deref(), &owned_config)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(provider)) => provider,
        Ok(Err(e)) => {
            log::warn!("Provider open task failed for {}: {e}", path.display());
            None
        }
        Err(_) => {
            log::warn!("Timed out after {timeout:?} opening {}", path.display());
            None
        }
    }
}

fn try_open_page_provider(
    path: &Path,
    password: Option<&str>,
    config: &EngineConfig,
) -> Result<Box<dyn PageProvider>> {
    if path.is_dir() {
        return Ok(Box::new(DirectoryPageProvider::from_dir(path)?));
    }

    match detect_document_kind(path) {
        DocumentKind::Archive(format) => open_archive_provider(path, format, password),
        DocumentKind::Unsupported => Err(Error::UnsupportedFormat(path.to_path_buf())),
        DocumentKind::Pdf => Ok(Box::new(DocumentPageProvider::open(
            path,
            config.timeouts.open(),
            config.timeouts.decode(),
        )?)),
    }
}

/// Zip is read in place; every other archive format is unpacked first.
pub(crate) fn open_archive_provider(
    path: &Path,
    format: ArchiveFormat,
    password: Option<&str>,
) -> Result<Box<dyn PageProvider>> {
    match format {
        ArchiveFormat::Zip => Ok(Box::new(ContainerPageProvider::open(path, password)?)),
        ArchiveFormat::Unknown => Err(Error::UnsupportedFormat(path.to_path_buf())),
        _ => Ok(Box::new(DirectoryPageProvider::from_archive(path, password)?)),
    }
}

/// Decode an in-memory image, guessing its format from the content.
pub fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(image)
}

pub fn decode_image_file(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image)
}

/// Numeric-aware, case-insensitive ordering: `page2` sorts before `page10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks::new(a);
    let mut right = Chunks::new(b);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x, y) {
                    (Chunk::Digits(x), Chunk::Digits(y)) => {
                        let x = x.trim_start_matches('0');
                        let y = y.trim_start_matches('0');
                        x.len().cmp(&y.len()).then_with(|| x.cmp(y))
                    }
                    (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
                    (Chunk::Text(x), Chunk::Text(y)) => x
                        .chars()
                        .flat_map(char::to_lowercase)
                        .cmp(y.chars().flat_map(char::to_lowercase)),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digits)
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (chunk, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(if digits {
            Chunk::Digits(chunk)
        } else {
            Chunk::Text(chunk)
        })
    }
}

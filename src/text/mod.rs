use mupdf::{Document, TextPageFlags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::archive::reader::{self, EntryHeader, EntryVisitor};
use crate::archive::{detect_document_kind, ArchiveFormat, DocumentKind};
use crate::error::{Error, Result};
use crate::pages::providers::document::{document_page_count, open_document};
use crate::pages::{natural_cmp, open_archive_provider, PageProvider};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md"];

/// A run of text on a page. Coordinates are zero when the source carries no
/// layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl TextSpan {
    pub fn unpositioned(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    }
}

pub type PageSpans = Vec<TextSpan>;

/// Per-page text of one document, in page order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextIndex {
    pages: Vec<PageSpans>,
}

impl TextIndex {
    pub fn new(pages: Vec<PageSpans>) -> Self {
        Self { pages }
    }

    /// Extract the text of every page of `path`.
    ///
    /// PDFs yield one span per text line with real bounds. Archives yield one
    /// unpositioned span per `.txt`/`.md` entry, placed on the pages of the
    /// same provider a reader would open; image-only archives produce empty
    /// pages.
    pub fn build(path: &Path, password: Option<&str>) -> Result<Self> {
        let index = match detect_document_kind(path) {
            DocumentKind::Pdf => Self::from_document(path)?,
            DocumentKind::Archive(ArchiveFormat::Unknown) | DocumentKind::Unsupported => {
                return Err(Error::UnsupportedFormat(path.to_path_buf()))
            }
            DocumentKind::Archive(format) => {
                let provider = open_archive_provider(path, format, password)?;
                Self::from_archive(path, format, password, &provider.page_names())?
            }
        };
        index.log_built(path);
        Ok(index)
    }

    /// Index `path` against pages an open provider already serves, so the
    /// archive is not unpacked a second time.
    pub fn build_for(path: &Path, password: Option<&str>, provider: &dyn PageProvider) -> Result<Self> {
        let index = match detect_document_kind(path) {
            DocumentKind::Pdf => Self::from_document(path)?,
            DocumentKind::Archive(ArchiveFormat::Unknown) | DocumentKind::Unsupported => {
                return Err(Error::UnsupportedFormat(path.to_path_buf()))
            }
            DocumentKind::Archive(format) => {
                Self::from_archive(path, format, password, &provider.page_names())?
            }
        };
        index.log_built(path);
        Ok(index)
    }

    fn log_built(&self, path: &Path) {
        log::info!(
            "Indexed {} pages ({} spans) of {}",
            self.page_count(),
            self.span_count(),
            path.display()
        );
    }

    /// [`TextIndex::build`] on a blocking worker.
    pub fn build_in_background(path: PathBuf, password: Option<String>) -> JoinHandle<Result<Self>> {
        tokio::task::spawn_blocking(move || Self::build(&path, password.as_deref()))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, index: usize) -> Option<&PageSpans> {
        self.pages.get(index)
    }

    pub fn span_count(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    /// Pages with a span containing `query`, ignoring case. A blank query
    /// matches nothing; surrounding whitespace is part of the needle.
    pub fn search(&self, query: &str) -> BTreeSet<usize> {
        if query.trim().is_empty() {
            return BTreeSet::new();
        }
        let needle = query.to_lowercase();
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, spans)| {
                spans
                    .iter()
                    .any(|span| span.text.to_lowercase().contains(&needle))
            })
            .map(|(index, _)| index)
            .collect()
    }

    fn from_document(path: &Path) -> Result<Self> {
        let document = open_document(path)?;
        let count = document_page_count(&document)?;
        let mut pages = Vec::with_capacity(count);
        for index in 0..count {
            match document_page_spans(&document, index) {
                Ok(spans) => pages.push(spans),
                Err(e) => {
                    log::warn!("No text for page {index} of {}: {e}", path.display());
                    pages.push(Vec::new());
                }
            }
        }
        Ok(Self { pages })
    }

    /// `pages` holds the entry name of every page in page order.
    fn from_archive(
        path: &Path,
        format: ArchiveFormat,
        password: Option<&str>,
        pages: &[String],
    ) -> Result<Self> {
        let mut collector = SidecarCollector::default();
        if let Err(e) = reader::visit_entries(path, format, password, &mut collector) {
            log::warn!("Text scan of {} stopped early: {e}", path.display());
        }

        Ok(Self {
            pages: assign_sidecars(pages, collector.texts),
        })
    }
}

fn document_page_spans(document: &Document, index: usize) -> Result<PageSpans> {
    let page = document
        .load_page(index as i32)
        .map_err(|e| Error::Render(format!("Failed to load page {index}: {e:?}")))?;
    let text_page = page
        .to_text_page(TextPageFlags::empty())
        .map_err(|e| Error::Render(format!("Failed to extract text of page {index}: {e:?}")))?;

    let mut spans = Vec::new();
    for block in text_page.blocks() {
        for line in block.lines() {
            let text: String = line.chars().filter_map(|c| c.char()).collect();
            if text.trim().is_empty() {
                continue;
            }
            let bounds = line.bounds();
            spans.push(TextSpan {
                text,
                x: bounds.x0,
                y: bounds.y0,
                width: bounds.x1 - bounds.x0,
                height: bounds.y1 - bounds.y0,
            });
        }
    }
    Ok(spans)
}

fn is_text_name(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Entry name without its extension, lowercased, `/` separated.
fn entry_stem(name: &str) -> String {
    let normalized = name.replace('\\', "/").to_lowercase();
    let (dir, file) = match normalized.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, normalized.as_str()),
    };
    let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
    match dir {
        Some(dir) => format!("{dir}/{stem}"),
        None => stem.to_string(),
    }
}

fn base_stem(name: &str) -> String {
    let stem = entry_stem(name);
    match stem.rsplit_once('/') {
        Some((_, base)) => base.to_string(),
        None => stem,
    }
}

/// Place each text entry on the page whose image shares its folder and stem,
/// then on the first page sharing only its stem, otherwise on the page at the
/// entry's position among the text entries, clamped to the last page.
fn assign_sidecars(images: &[String], mut texts: Vec<(String, String)>) -> Vec<PageSpans> {
    let mut pages: Vec<PageSpans> = vec![Vec::new(); images.len()];
    if pages.is_empty() {
        return pages;
    }

    let mut by_entry: HashMap<String, usize> = HashMap::new();
    let mut by_base: HashMap<String, usize> = HashMap::new();
    for (i, name) in images.iter().enumerate() {
        by_entry.entry(entry_stem(name)).or_insert(i);
        by_base.entry(base_stem(name)).or_insert(i);
    }
    texts.sort_by(|a, b| natural_cmp(&a.0, &b.0));

    let last = pages.len() - 1;
    for (position, (name, content)) in texts.into_iter().enumerate() {
        let page = by_entry
            .get(&entry_stem(&name))
            .or_else(|| by_base.get(&base_stem(&name)))
            .copied()
            .unwrap_or(position.min(last));
        pages[page].push(TextSpan::unpositioned(content));
    }
    pages
}

#[derive(Default)]
struct SidecarCollector {
    texts: Vec<(String, String)>,
}

impl EntryVisitor for SidecarCollector {
    fn wants(&mut self, header: &EntryHeader) -> bool {
        is_text_name(&header.name)
    }

    fn entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> ControlFlow<()> {
        let mut bytes = Vec::new();
        match data.read_to_end(&mut bytes) {
            Ok(_) => self
                .texts
                .push((header.name.clone(), String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) => log::debug!("Skipping text entry {}: {e}", header.name),
        }
        ControlFlow::Continue(())
    }

    fn entry_error(&mut self, name: &str, error: String) -> ControlFlow<()> {
        log::debug!("Skipping text entry {name}: {error}");
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub query: String,
    pub pages: BTreeSet<usize>,
}

/// Holds the latest search over an index.
///
/// Every `run` rescans the whole index and overwrites the stored result;
/// whichever run stores last is what `latest` reports.
pub struct SearchState {
    index: Arc<TextIndex>,
    latest: Mutex<SearchResult>,
}

impl SearchState {
    pub fn new(index: Arc<TextIndex>) -> Self {
        Self {
            index,
            latest: Mutex::new(SearchResult::default()),
        }
    }

    pub fn run(&self, query: &str) -> BTreeSet<usize> {
        let pages = self.index.search(query);
        if let Ok(mut latest) = self.latest.lock() {
            *latest = SearchResult {
                query: query.to_string(),
                pages: pages.clone(),
            };
        }
        pages
    }

    pub fn latest(&self) -> SearchResult {
        self.latest
            .lock()
            .map(|latest| latest.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = SearchResult::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn index_with_dragons() -> TextIndex {
        let mut pages = vec![Vec::new(); 7];
        pages[0].push(TextSpan::unpositioned("Once upon a time"));
        pages[2].push(TextSpan::unpositioned("The DRAGON wakes"));
        pages[5].push(TextSpan::unpositioned("dragonfire everywhere"));
        pages[6].push(TextSpan::unpositioned("a drag on the evening"));
        TextIndex::new(pages)
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let index = index_with_dragons();
        assert_eq!(index.search("dragon"), BTreeSet::from([2, 5]));
        assert_eq!(index.search("Dragon "), BTreeSet::from([2]));
    }

    #[test]
    fn whitespace_in_the_query_is_significant() {
        let mut pages = vec![Vec::new(); 2];
        pages[0].push(TextSpan::unpositioned("the dragon"));
        pages[1].push(TextSpan::unpositioned("on the hill"));
        let index = TextIndex::new(pages);

        assert_eq!(index.search("on "), BTreeSet::from([1]));
        assert_eq!(index.search("on"), BTreeSet::from([0, 1]));
    }

    #[test]
    fn blank_query_matches_nothing() {
        let index = index_with_dragons();
        assert!(index.search("").is_empty());
        assert!(index.search("   ").is_empty());
    }

    #[test]
    fn latest_search_wins() {
        let state = SearchState::new(Arc::new(index_with_dragons()));
        state.run("dragon");
        state.run("once");

        let latest = state.latest();
        assert_eq!(latest.query, "once");
        assert_eq!(latest.pages, BTreeSet::from([0]));

        state.clear();
        assert_eq!(state.latest(), SearchResult::default());
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("Failed to create zip");
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default())
                .expect("Failed to start file");
            zip.write_all(data).expect("Failed to write entry");
        }
        zip.finish().expect("Failed to finish zip");
    }

    #[test]
    fn sidecars_land_on_matching_pages() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("book.cbz");
        write_zip(
            &path,
            &[
                ("p10.png", b"x"),
                ("p1.png", b"x"),
                ("p2.png", b"x"),
                ("p2.txt", b"a dragon appears"),
                ("zz-notes.md", b"translator notes"),
            ],
        );

        let index = TextIndex::build(&path, None).expect("Index should build");
        assert_eq!(index.page_count(), 3);
        assert_eq!(index.search("dragon"), BTreeSet::from([1]));
        // Second text entry without a matching image goes to position 1.
        assert_eq!(index.search("translator"), BTreeSet::from([1]));
        assert!(index.page(2).is_some_and(|spans| spans.is_empty()));
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 40, 40]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png)
            .expect("Failed to encode png");
        buf.into_inner()
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = File::create(path).expect("Failed to create tar.gz");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data.as_slice())
                .expect("Failed to append entry");
        }
        builder
            .into_inner()
            .expect("Failed to finish tar")
            .finish()
            .expect("Failed to finish gzip");
    }

    #[test]
    fn unpacked_archive_text_matches_reader_pages() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("chapters.tar.gz");
        write_tar_gz(
            &path,
            &[
                ("b/1.png", png(5, 4)),
                ("a/2.png", png(3, 2)),
                ("a/2.txt", b"the dragon lands".to_vec()),
                ("a/0.png", b"corrupt page".to_vec()),
                ("c/1.png", png(9, 9)),
                ("c/1.txt", b"a wyvern circles".to_vec()),
            ],
        );

        let provider = crate::pages::open_page_provider(
            &path,
            None,
            &crate::config::EngineConfig::default(),
        )
        .expect("provider");
        // The corrupt page and the second `1.png` never become pages.
        assert_eq!(provider.page_names(), vec!["a/2.png", "b/1.png"]);

        let index = TextIndex::build(&path, None).expect("Index should build");
        assert_eq!(index.page_count(), provider.page_count());
        assert_eq!(index.search("dragon"), BTreeSet::from([0]));
        let page = provider.get_page(0).expect("page 0");
        assert_eq!((page.width(), page.height()), (3, 2));

        // No page from folder c survives, so its text falls back to the
        // first page with the same stem.
        assert_eq!(index.search("wyvern"), BTreeSet::from([1]));

        let reused = TextIndex::build_for(&path, None, provider.as_ref()).expect("Index should build");
        assert_eq!(reused, index);
    }

    #[test]
    fn folder_qualified_stems_win_over_bare_stems() {
        let images = vec!["a/1.png".to_string(), "b/1.png".to_string()];
        let texts = vec![("b/1.txt".to_string(), "second".to_string())];
        let pages = assign_sidecars(&images, texts);
        assert!(pages[0].is_empty());
        assert_eq!(pages[1].len(), 1);
    }

    #[test]
    fn image_only_archive_has_empty_pages() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("book.cbz");
        write_zip(&path, &[("1.png", b"x"), ("2.png", b"x")]);

        let index = TextIndex::build(&path, None).expect("Index should build");
        assert_eq!(index.page_count(), 2);
        assert_eq!(index.span_count(), 0);
    }

    #[test]
    fn unplaced_sidecars_clamp_to_last_page() {
        let images = vec!["a.png".to_string()];
        let texts = vec![
            ("x.txt".to_string(), "one".to_string()),
            ("y.txt".to_string(), "two".to_string()),
        ];
        let pages = assign_sidecars(&images, texts);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].len(), 2);
    }

    #[test]
    fn unsupported_source_is_an_error() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("notes.doc");
        std::fs::write(&path, b"hello").expect("Failed to write");
        assert!(matches!(
            TextIndex::build(&path, None),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn background_build_completes() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("book.cbz");
        write_zip(&path, &[("1.png", b"x"), ("1.txt", b"Dragon")]);

        let index = TextIndex::build_in_background(path, None)
            .await
            .expect("join")
            .expect("Index should build");
        assert_eq!(index.search("dragon"), BTreeSet::from([0]));
    }
}

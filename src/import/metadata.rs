use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageReader};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Cursor, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::ProcessingStrategy;
use crate::archive::reader::{self, EntryHeader, EntryVisitor};
use crate::archive::{
    detect_document_kind, get_archive_info, is_image_name, ArchiveFormat, ArchiveInfo,
    DocumentKind,
};
use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::identity::quick_hash;
use crate::pages::providers::document::{document_page_count, open_document, render_page};
use crate::pages::{decode_image_bytes, natural_cmp};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

const COMIC_INFO_NAME: &str = "ComicInfo.xml";
const SIDECAR_NAMES: &[&str] = &["metadata.json", "series.json"];
/// Library-level sidecars looked up next to the file, after the per-file ones.
const SHARED_SIDECAR_NAMES: &[&str] =
    &["metadata.xml", "metadata.json", "series.json", "collection.json"];
const MAX_SIDECAR_BYTES: u64 = MIB;
const MAX_TAGS: usize = 20;
/// Edge of the thumbnail used for tone analysis.
const TONE_EDGE: u32 = 64;

const FILE_NAME_PATTERNS: &[&str] = &[
    r"^(?P<series>.+?)\s+v(?P<volume>\d+)\s+c(?P<chapter>\d+)(?:-\d+)?\s*\((?P<year>\d{4})\)\s*\[(?P<publisher>.+?)\]",
    r"^(?P<series>.+?)\s+#(?P<issue>\d+)\s*\((?P<year>\d{4})\)",
    r"^(?P<series>.+?)\s+Vol\.(?P<volume>\d+)\s+Ch\.(?P<chapter>\d+)",
    r"^(?P<series>.+?)\s+Chapter\s+(?P<chapter>\d+)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
    Square,
}

impl Orientation {
    pub fn of(width: u32, height: u32) -> Self {
        match width.cmp(&height) {
            std::cmp::Ordering::Less => Orientation::Portrait,
            std::cmp::Ordering::Greater => Orientation::Landscape,
            std::cmp::Ordering::Equal => Orientation::Square,
        }
    }
}

/// Fields recovered from a release-style file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNameInfo {
    pub series: Option<String>,
    pub volume: Option<u32>,
    pub issue: Option<u32>,
    pub chapter: Option<u32>,
    pub year: Option<i32>,
    pub publisher: Option<String>,
}

impl FileNameInfo {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    pub cover_width: u32,
    pub cover_height: u32,
    /// Mean luma of the cover, `0.0..=1.0`.
    pub brightness: f32,
    /// Mean saturation of the cover, `0.0..=1.0`.
    pub colorfulness: f32,
    /// Most common orientation among the sampled pages.
    pub orientation: Orientation,
    pub sampled_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComicMetadata {
    pub title: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub imported_at: DateTime<Utc>,
    pub quick_hash: String,
    pub kind: DocumentKind,
    pub page_count: usize,
    pub archive: Option<ArchiveInfo>,
    /// Entry name of the first page in reading order.
    pub cover: Option<String>,
    #[serde(flatten)]
    pub name_info: FileNameInfo,
    /// Scalar values from `ComicInfo.xml`, embedded `metadata.json` /
    /// `series.json` and sidecar files next to the source, in that order of
    /// precedence. ComicInfo keys are snake_cased (`PageCount` becomes
    /// `page_count`).
    pub custom_fields: BTreeMap<String, String>,
    pub analysis: Option<ImageAnalysis>,
    pub tags: Vec<String>,
    pub strategy: ProcessingStrategy,
    pub extraction_errors: Vec<String>,
}

/// Pre-flight checks run before any archive is opened.
/// An empty list means the file may be imported.
pub fn validate_file(path: &Path) -> Vec<String> {
    let mut errors = Vec::new();

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            errors.push(format!("File does not exist: {}", path.display()));
            return errors;
        }
        Err(e) => {
            errors.push(format!("File is not readable: {e}"));
            return errors;
        }
    };
    if !metadata.is_file() {
        errors.push(format!("Not a regular file: {}", path.display()));
        return errors;
    }
    if let Err(e) = fs::File::open(path) {
        errors.push(format!("File is not readable: {e}"));
    }

    let size = metadata.len();
    if size == 0 {
        errors.push("File is empty".to_string());
    }

    match detect_document_kind(path) {
        DocumentKind::Unsupported => {
            errors.push(format!("Unsupported file format: {}", path.display()));
        }
        kind => {
            let limit = max_file_size(kind);
            if size > limit {
                errors.push(format!(
                    "File exceeds the maximum size ({} MB)",
                    limit / MIB
                ));
            }
        }
    }

    errors
}

fn max_file_size(kind: DocumentKind) -> u64 {
    match kind {
        DocumentKind::Pdf => 10 * GIB,
        DocumentKind::Archive(ArchiveFormat::Zip | ArchiveFormat::Rar | ArchiveFormat::Rar5) => {
            5 * GIB
        }
        _ => GIB,
    }
}

fn file_name_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FILE_NAME_PATTERNS
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    log::warn!("Skipping file name pattern {pattern}: {e}");
                    None
                }
            })
            .collect()
    })
}

/// Parse series, numbering, year and publisher from a file stem.
/// The first matching pattern wins; no match yields an empty info.
pub fn parse_file_name(stem: &str) -> FileNameInfo {
    fn number<T: std::str::FromStr>(caps: &Captures<'_>, name: &str) -> Option<T> {
        caps.name(name).and_then(|m| m.as_str().parse().ok())
    }
    fn text(caps: &Captures<'_>, name: &str) -> Option<String> {
        caps.name(name)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    file_name_patterns()
        .iter()
        .find_map(|pattern| pattern.captures(stem))
        .map(|caps| FileNameInfo {
            series: text(&caps, "series"),
            volume: number(&caps, "volume"),
            issue: number(&caps, "issue"),
            chapter: number(&caps, "chapter"),
            year: number(&caps, "year"),
            publisher: text(&caps, "publisher"),
        })
        .unwrap_or_default()
}

/// Flatten a JSON object sidecar into string fields.
///
/// Strings, numbers and booleans are kept; arrays of those are joined with
/// `", "`. Nested objects and nulls are dropped.
pub fn parse_sidecar_json(content: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("Failed to parse sidecar JSON: {e}"))?;
    let Value::Object(object) = value else {
        return Err("Sidecar JSON is not an object".to_string());
    };

    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
                if parts.is_empty() {
                    continue;
                }
                parts.join(", ")
            }
            other => match scalar_to_string(&other) {
                Some(text) => text,
                None => continue,
            },
        };
        fields.insert(key, text);
    }
    Ok(fields)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read the simple child elements of a `ComicInfo.xml` root into fields.
///
/// Element names become snake_case keys; elements with children (such as
/// `Pages`) and empty values are skipped.
pub fn parse_comic_info(content: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                match depth {
                    1 => saw_root = true,
                    2 => {
                        current = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                        text.clear();
                    }
                    _ => current = None,
                }
            }
            Ok(Event::Empty(_)) if depth >= 2 => current = None,
            Ok(Event::Empty(_)) if depth == 0 => saw_root = true,
            Ok(Event::Text(e)) if depth == 2 && current.is_some() => {
                let value = e
                    .unescape()
                    .map_err(|e| format!("Failed to parse ComicInfo XML: {e}"))?;
                text.push_str(&value);
            }
            Ok(Event::CData(e)) if depth == 2 && current.is_some() => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some(name) = current.take() {
                        let value = text.trim();
                        if !value.is_empty() {
                            fields.insert(snake_case(&name), value.to_string());
                        }
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(format!(
                    "Failed to parse ComicInfo XML at byte {}: {e}",
                    reader.buffer_position()
                ))
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err("ComicInfo XML has no root element".to_string());
    }
    Ok(fields)
}

/// `PageCount` -> `page_count`, `LanguageISO` -> `language_iso`.
fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn is_sidecar_name(name: &str) -> bool {
    let base = base_name(name);
    base.eq_ignore_ascii_case(COMIC_INFO_NAME)
        || SIDECAR_NAMES
            .iter()
            .any(|sidecar| base.eq_ignore_ascii_case(sidecar))
}

fn merge_fields(metadata: &mut ComicMetadata, fields: BTreeMap<String, String>) {
    for (key, value) in fields {
        metadata.custom_fields.entry(key).or_insert(value);
    }
}

/// Let well-known fields refine what the file name gave.
fn apply_known_fields(metadata: &mut ComicMetadata) {
    let fields = &metadata.custom_fields;
    let text = |key: &str| {
        fields
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let number = |key: &str| fields.get(key).and_then(|v| v.trim().parse::<u32>().ok());

    let info = &mut metadata.name_info;
    if let Some(series) = text("series") {
        info.series = Some(series);
    }
    if let Some(publisher) = text("publisher") {
        info.publisher = Some(publisher);
    }
    if let Some(volume) = number("volume") {
        info.volume = Some(volume);
    }
    if let Some(issue) = number("number").or_else(|| number("issue")) {
        info.issue = Some(issue);
    }
    if let Some(year) = fields.get("year").and_then(|v| v.trim().parse::<i32>().ok()) {
        info.year = Some(year);
    }
}

/// What the analysis stage gets to look at.
pub(crate) enum AnalysisInput {
    None,
    /// Encoded page images in reading order; the first is the cover.
    Pages(Vec<(String, Vec<u8>)>),
    /// A cover already rendered by the document backend.
    Rendered(DynamicImage),
}

/// Result of the I/O stage of metadata extraction, waiting for analysis.
pub(crate) struct PendingMetadata {
    pub(crate) metadata: ComicMetadata,
    pub(crate) input: AnalysisInput,
}

/// Build the metadata record for one file.
///
/// `on_progress` receives 0.3 once the file has been identified, 0.6 after
/// analysis (thorough only) and 0.8 when done.
pub fn extract_metadata(
    path: &Path,
    strategy: ProcessingStrategy,
    config: &ImportConfig,
    on_progress: &dyn Fn(f32),
) -> Result<ComicMetadata> {
    let pending = read_metadata(path, strategy, config, on_progress)?;
    Ok(finish_metadata(pending, on_progress))
}

/// Everything that touches the file: listing, sidecars and the raw bytes of
/// the pages the analysis will sample.
pub(crate) fn read_metadata(
    path: &Path,
    strategy: ProcessingStrategy,
    config: &ImportConfig,
    on_progress: &dyn Fn(f32),
) -> Result<PendingMetadata> {
    let fs_meta = fs::metadata(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.clone());
    let kind = detect_document_kind(path);

    let mut metadata = ComicMetadata {
        title: stem.clone(),
        file_path: path.to_path_buf(),
        file_name,
        file_size: fs_meta.len(),
        modified_at: fs_meta.modified().ok().map(DateTime::<Utc>::from),
        imported_at: Utc::now(),
        quick_hash: quick_hash(path),
        kind,
        page_count: 0,
        archive: None,
        cover: None,
        name_info: parse_file_name(&stem),
        custom_fields: BTreeMap::new(),
        analysis: None,
        tags: Vec::new(),
        strategy,
        extraction_errors: Vec::new(),
    };
    on_progress(0.3);

    let analyze = strategy != ProcessingStrategy::Fast;
    let input = match kind {
        DocumentKind::Archive(format) => scan_archive(path, format, analyze, config, &mut metadata)?,
        DocumentKind::Pdf => scan_document(path, analyze, &mut metadata)?,
        DocumentKind::Unsupported => return Err(Error::UnsupportedFormat(path.to_path_buf())),
    };

    read_external_sidecars(path, &stem, &mut metadata);
    apply_known_fields(&mut metadata);

    Ok(PendingMetadata { metadata, input })
}

/// CPU-only stage: cover and orientation analysis, title and tags.
pub(crate) fn finish_metadata(pending: PendingMetadata, on_progress: &dyn Fn(f32)) -> ComicMetadata {
    let PendingMetadata {
        mut metadata,
        input,
    } = pending;

    match input {
        AnalysisInput::None => {}
        AnalysisInput::Pages(samples) => {
            let samples: Vec<(&str, &[u8])> = samples
                .iter()
                .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
                .collect();
            match analyze_samples(&samples) {
                Ok(analysis) => metadata.analysis = Some(analysis),
                Err(e) => metadata.extraction_errors.push(e),
            }
        }
        AnalysisInput::Rendered(cover) => {
            metadata.analysis = Some(analyze_cover(&cover, Vec::new()));
        }
    }

    if let Some(title) = metadata.custom_fields.get("title").filter(|t| !t.trim().is_empty()) {
        metadata.title = title.trim().to_string();
    }

    if metadata.strategy == ProcessingStrategy::Thorough {
        on_progress(0.6);
        metadata.tags = heuristic_tags(&metadata);
    }
    on_progress(0.8);

    log::debug!(
        "Extracted metadata for {} ({} pages, {:?})",
        metadata.file_path.display(),
        metadata.page_count,
        metadata.strategy
    );
    metadata
}

fn scan_archive(
    path: &Path,
    format: ArchiveFormat,
    analyze: bool,
    config: &ImportConfig,
    metadata: &mut ComicMetadata,
) -> Result<AnalysisInput> {
    let headers = reader::list_entries(path, format, None)?;
    let pages = sorted_page_names(&headers);

    metadata.page_count = pages.len();
    metadata.cover = pages.first().map(|name| name.to_string());
    metadata.archive = Some(get_archive_info(path));

    let sample: Vec<String> = if analyze {
        pages
            .iter()
            .take(config.analysis_sample_pages.max(1))
            .map(|name| name.to_string())
            .collect()
    } else {
        Vec::new()
    };

    let mut wanted: HashSet<String> = sample.iter().cloned().collect();
    wanted.extend(
        headers
            .iter()
            .filter(|h| h.is_file() && is_sidecar_name(&h.name) && h.size <= MAX_SIDECAR_BYTES)
            .map(|h| h.name.clone()),
    );
    if wanted.is_empty() {
        return Ok(AnalysisInput::None);
    }

    let mut collector = EntryCollector::new(wanted);
    if let Err(e) = reader::visit_entries(path, format, None, &mut collector) {
        collector.errors.push(e.to_string());
    }

    // ComicInfo first so it wins over the JSON sidecars.
    let mut sidecar_errors = Vec::new();
    if let Some((entry, bytes)) = collector.shallowest(COMIC_INFO_NAME) {
        match parse_comic_info(&String::from_utf8_lossy(bytes)) {
            Ok(fields) => merge_fields(metadata, fields),
            Err(e) => sidecar_errors.push(format!("{entry}: {e}")),
        }
    }
    for name in SIDECAR_NAMES {
        if let Some((entry, bytes)) = collector.shallowest(name) {
            match parse_sidecar_json(&String::from_utf8_lossy(bytes)) {
                Ok(fields) => merge_fields(metadata, fields),
                Err(e) => sidecar_errors.push(format!("{entry}: {e}")),
            }
        }
    }
    collector.errors.extend(sidecar_errors);

    let input = if analyze {
        let samples = sample
            .into_iter()
            .filter_map(|name| collector.contents.remove(&name).map(|bytes| (name, bytes)))
            .collect();
        AnalysisInput::Pages(samples)
    } else {
        AnalysisInput::None
    };

    metadata.extraction_errors.extend(collector.errors);
    Ok(input)
}

fn sorted_page_names(headers: &[EntryHeader]) -> Vec<&str> {
    let mut pages: Vec<&str> = headers
        .iter()
        .filter(|h| h.is_file() && is_image_name(&h.name))
        .map(|h| h.name.as_str())
        .collect();
    pages.sort_by(|a, b| natural_cmp(a, b));
    pages
}

/// Entry name and encoded bytes of the first page in reading order.
pub(crate) fn read_cover_page(
    path: &Path,
    format: ArchiveFormat,
) -> Result<Option<(String, Vec<u8>)>> {
    let headers = reader::list_entries(path, format, None)?;
    let Some(cover) = sorted_page_names(&headers).first().map(|n| n.to_string()) else {
        return Ok(None);
    };

    let mut collector = EntryCollector::new(HashSet::from([cover.clone()]));
    reader::visit_entries(path, format, None, &mut collector)?;
    if let Some(error) = collector.errors.first() {
        return Err(Error::Corrupt(error.clone()));
    }
    Ok(collector
        .contents
        .remove(&cover)
        .map(|bytes| (cover, bytes)))
}

fn scan_document(path: &Path, analyze: bool, metadata: &mut ComicMetadata) -> Result<AnalysisInput> {
    let document = open_document(path)?;
    metadata.page_count = document_page_count(&document)?;

    if analyze && metadata.page_count > 0 {
        match render_page(&document, 0) {
            Ok(cover) => return Ok(AnalysisInput::Rendered(cover)),
            Err(e) => metadata.extraction_errors.push(e.to_string()),
        }
    }
    Ok(AnalysisInput::None)
}

/// Merge metadata files lying next to `path`: `<stem>.xml`, `<stem>.nfo`
/// (ComicInfo layout), `<stem>.json`, `<stem>.txt` (kept as `notes`), then the
/// shared library sidecars. Fields already known are never overwritten.
fn read_external_sidecars(path: &Path, stem: &str, metadata: &mut ComicMetadata) {
    let Some(dir) = path.parent() else {
        return;
    };
    let per_file = ["xml", "nfo", "json", "txt"].map(|ext| format!("{stem}.{ext}"));
    let candidates = per_file
        .iter()
        .map(String::as_str)
        .chain(SHARED_SIDECAR_NAMES.iter().copied());

    for name in candidates {
        let sidecar = dir.join(name);
        if sidecar == path {
            continue;
        }
        let small_file = fs::metadata(&sidecar)
            .map(|m| m.is_file() && m.len() <= MAX_SIDECAR_BYTES)
            .unwrap_or(false);
        if !small_file {
            continue;
        }
        let content = match fs::read_to_string(&sidecar) {
            Ok(content) => content,
            Err(e) => {
                metadata.extraction_errors.push(format!("{name}: {e}"));
                continue;
            }
        };

        let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        let parsed = match ext {
            "xml" | "nfo" => parse_comic_info(&content),
            "json" => parse_sidecar_json(&content),
            _ => Ok(BTreeMap::from([("notes".to_string(), content.trim().to_string())])),
        };
        match parsed {
            Ok(fields) => {
                log::debug!("Merged sidecar {}", sidecar.display());
                merge_fields(metadata, fields);
            }
            Err(e) => metadata.extraction_errors.push(format!("{name}: {e}")),
        }
    }
}

/// Collects the bytes of a known set of entries and stops once all arrived.
struct EntryCollector {
    wanted: HashSet<String>,
    contents: HashMap<String, Vec<u8>>,
    errors: Vec<String>,
}

impl EntryCollector {
    fn new(wanted: HashSet<String>) -> Self {
        Self {
            wanted,
            contents: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Collected entry with base name `name`, nearest the archive root.
    fn shallowest(&self, name: &str) -> Option<(&str, &[u8])> {
        self.contents
            .iter()
            .filter(|(entry, _)| base_name(entry).eq_ignore_ascii_case(name))
            .min_by(|a, b| {
                let depth = |n: &str| n.matches(['/', '\\']).count();
                depth(a.0).cmp(&depth(b.0)).then_with(|| a.0.cmp(b.0))
            })
            .map(|(entry, bytes)| (entry.as_str(), bytes.as_slice()))
    }
}

impl EntryVisitor for EntryCollector {
    fn wants(&mut self, header: &EntryHeader) -> bool {
        self.wanted.contains(&header.name)
    }

    fn entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> ControlFlow<()> {
        let mut bytes = Vec::new();
        match data.read_to_end(&mut bytes) {
            Ok(_) => {
                self.contents.insert(header.name.clone(), bytes);
            }
            Err(e) => self
                .errors
                .push(format!("Failed to read {}: {e}", header.name)),
        }
        self.wanted.remove(&header.name);
        if self.wanted.is_empty() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn entry_error(&mut self, name: &str, error: String) -> ControlFlow<()> {
        self.errors.push(format!("{name}: {error}"));
        ControlFlow::Continue(())
    }
}

/// `samples` are in reading order; the first one is the cover.
fn analyze_samples(samples: &[(&str, &[u8])]) -> std::result::Result<ImageAnalysis, String> {
    let Some((cover_name, cover_bytes)) = samples.first() else {
        return Err("No page images available for analysis".to_string());
    };

    let mut orientations = Vec::with_capacity(samples.len());
    for (name, bytes) in samples {
        match image_dimensions(bytes) {
            Ok((width, height)) => orientations.push(Orientation::of(width, height)),
            Err(e) => log::debug!("Skipping {name} in orientation sample: {e}"),
        }
    }

    let cover = decode_image_bytes(cover_bytes).map_err(|e| format!("{cover_name}: {e}"))?;
    Ok(analyze_cover(&cover, orientations))
}

fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let dimensions = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;
    Ok(dimensions)
}

fn analyze_cover(cover: &DynamicImage, mut orientations: Vec<Orientation>) -> ImageAnalysis {
    let (cover_width, cover_height) = (cover.width(), cover.height());
    if orientations.is_empty() {
        orientations.push(Orientation::of(cover_width, cover_height));
    }
    let (brightness, colorfulness) = tone(cover);

    ImageAnalysis {
        cover_width,
        cover_height,
        brightness,
        colorfulness,
        orientation: dominant(&orientations),
        sampled_pages: orientations.len(),
    }
}

/// Mean luma and mean saturation over a small thumbnail.
fn tone(image: &DynamicImage) -> (f32, f32) {
    let small = image.thumbnail(TONE_EDGE, TONE_EDGE).to_rgb8();
    let count = small.width() as usize * small.height() as usize;
    if count == 0 {
        return (0.0, 0.0);
    }

    let (mut luma, mut saturation) = (0.0f32, 0.0f32);
    for pixel in small.pixels() {
        let [r, g, b] = pixel.0.map(|c| c as f32 / 255.0);
        luma += 0.299 * r + 0.587 * g + 0.114 * b;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        if max > 0.0 {
            saturation += (max - min) / max;
        }
    }
    (luma / count as f32, saturation / count as f32)
}

fn dominant(orientations: &[Orientation]) -> Orientation {
    let mut best = (Orientation::Portrait, 0usize);
    for candidate in [Orientation::Portrait, Orientation::Landscape, Orientation::Square] {
        let count = orientations.iter().filter(|o| **o == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

/// Tags derived from sidecar fields and cover analysis, deduplicated.
fn heuristic_tags(metadata: &ComicMetadata) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let mut push = |tag: String| {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    };

    for key in ["tags", "genre", "genres"] {
        if let Some(value) = metadata.custom_fields.get(key) {
            value.split([',', ';']).for_each(|t| push(t.to_string()));
        }
    }

    if let Some(analysis) = &metadata.analysis {
        if analysis.brightness < 0.3 {
            push("dark".to_string());
        } else if analysis.brightness > 0.7 {
            push("bright".to_string());
        }
        if analysis.colorfulness < 0.3 {
            push("monochrome".to_string());
        } else if analysis.colorfulness > 0.7 {
            push("colorful".to_string());
        }
        if analysis.orientation == Orientation::Landscape {
            push("landscape".to_string());
        }
    }

    tags.truncate(MAX_TAGS);
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)
            .expect("Failed to encode png");
        buf.into_inner()
    }

    fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
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
    fn release_style_name_is_parsed() {
        let info = parse_file_name("Blue Harbor v01 c001-010 (2023) [Tidewater Press]");
        assert_eq!(info.series.as_deref(), Some("Blue Harbor"));
        assert_eq!(info.volume, Some(1));
        assert_eq!(info.chapter, Some(1));
        assert_eq!(info.year, Some(2023));
        assert_eq!(info.publisher.as_deref(), Some("Tidewater Press"));
    }

    #[test]
    fn issue_and_chapter_names_are_parsed() {
        let issue = parse_file_name("Night Watch #12 (2020)");
        assert_eq!(issue.series.as_deref(), Some("Night Watch"));
        assert_eq!(issue.issue, Some(12));
        assert_eq!(issue.year, Some(2020));

        let vol = parse_file_name("Sky Garden Vol.3 Ch.14");
        assert_eq!(vol.volume, Some(3));
        assert_eq!(vol.chapter, Some(14));

        let chapter = parse_file_name("Iron Bloom Chapter 7");
        assert_eq!(chapter.series.as_deref(), Some("Iron Bloom"));
        assert_eq!(chapter.chapter, Some(7));
        assert_eq!(chapter.volume, None);
    }

    #[test]
    fn unmatched_name_yields_empty_info() {
        assert!(parse_file_name("holiday scans").is_empty());
    }

    #[test]
    fn sidecar_keeps_scalars_only() {
        let fields = parse_sidecar_json(
            r#"{"title": "Moon", "issue": 4, "mature": false, "tags": ["space", "drama"], "extra": {"a": 1}, "none": null}"#,
        )
        .expect("valid sidecar");
        assert_eq!(fields.get("title").map(String::as_str), Some("Moon"));
        assert_eq!(fields.get("issue").map(String::as_str), Some("4"));
        assert_eq!(fields.get("mature").map(String::as_str), Some("false"));
        assert_eq!(fields.get("tags").map(String::as_str), Some("space, drama"));
        assert!(!fields.contains_key("extra"));
        assert!(!fields.contains_key("none"));

        assert!(parse_sidecar_json("[1, 2]").is_err());
        assert!(parse_sidecar_json("not json").is_err());
    }

    #[test]
    fn validation_reports_missing_empty_and_unsupported() {
        let dir = tempdir().expect("Failed to create temp dir");

        let missing = validate_file(&dir.path().join("gone.cbz"));
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("does not exist"));

        let empty = dir.path().join("empty.cbz");
        File::create(&empty).expect("Failed to create file");
        assert!(validate_file(&empty).iter().any(|e| e == "File is empty"));

        let text = dir.path().join("notes.txt");
        fs::write(&text, b"hello").expect("Failed to write");
        assert!(validate_file(&text)
            .iter()
            .any(|e| e.starts_with("Unsupported file format")));

        assert!(validate_file(dir.path())
            .iter()
            .any(|e| e.starts_with("Not a regular file")));
    }

    #[test]
    fn valid_archive_passes_validation() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("ok.cbz");
        write_zip(&path, &[("01.png", png_bytes(2, 3, [1, 2, 3]))]);
        assert!(validate_file(&path).is_empty());
    }

    #[test]
    fn size_limits_follow_the_format() {
        assert_eq!(max_file_size(DocumentKind::Pdf), 10 * GIB);
        assert_eq!(max_file_size(DocumentKind::Archive(ArchiveFormat::Rar5)), 5 * GIB);
        assert_eq!(max_file_size(DocumentKind::Archive(ArchiveFormat::SevenZip)), GIB);
    }

    #[test]
    fn thorough_extraction_reads_pages_sidecar_and_tags() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("Iron Bloom Chapter 7.cbz");
        write_zip(
            &path,
            &[
                ("page10.png", png_bytes(20, 10, [240, 240, 240])),
                ("page2.png", png_bytes(20, 10, [240, 240, 240])),
                ("page1.png", png_bytes(20, 10, [250, 250, 250])),
                (
                    "metadata.json",
                    br#"{"title": "Iron Bloom: Rust Season", "tags": "Steampunk; Action"}"#.to_vec(),
                ),
            ],
        );

        let progress = std::sync::Mutex::new(Vec::new());
        let record = |p: f32| progress.lock().expect("progress lock").push(p);
        let metadata = extract_metadata(
            &path,
            ProcessingStrategy::Thorough,
            &ImportConfig::default(),
            &record,
        )
        .expect("extraction");

        assert_eq!(metadata.page_count, 3);
        assert_eq!(metadata.cover.as_deref(), Some("page1.png"));
        assert_eq!(metadata.title, "Iron Bloom: Rust Season");
        assert_eq!(metadata.name_info.chapter, Some(7));
        assert_eq!(metadata.archive.as_ref().map(|a| a.entry_count), Some(4));

        let analysis = metadata.analysis.as_ref().expect("analysis");
        assert_eq!((analysis.cover_width, analysis.cover_height), (20, 10));
        assert_eq!(analysis.orientation, Orientation::Landscape);
        assert_eq!(analysis.sampled_pages, 3);

        assert_eq!(
            metadata.tags,
            vec!["steampunk", "action", "bright", "monochrome", "landscape"]
        );
        assert!(metadata.extraction_errors.is_empty());
        assert_eq!(*progress.lock().expect("progress lock"), vec![0.3, 0.6, 0.8]);
    }

    #[test]
    fn fast_extraction_skips_analysis() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("quick.cbz");
        write_zip(&path, &[("a.png", png_bytes(4, 8, [10, 200, 10]))]);

        let metadata =
            extract_metadata(&path, ProcessingStrategy::Fast, &ImportConfig::default(), &|_| {})
                .expect("extraction");
        assert_eq!(metadata.page_count, 1);
        assert!(metadata.analysis.is_none());
        assert!(metadata.tags.is_empty());
        assert_eq!(metadata.title, "quick");
    }

    #[test]
    fn broken_cover_is_recorded_not_fatal() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("broken.cbz");
        write_zip(&path, &[("01.png", b"not really a png".to_vec())]);

        let metadata = extract_metadata(
            &path,
            ProcessingStrategy::Balanced,
            &ImportConfig::default(),
            &|_| {},
        )
        .expect("extraction");
        assert_eq!(metadata.page_count, 1);
        assert!(metadata.analysis.is_none());
        assert_eq!(metadata.extraction_errors.len(), 1);
    }

    #[test]
    fn comic_info_fields_are_snake_cased() {
        let fields = parse_comic_info(
            r#"<?xml version="1.0" encoding="utf-8"?>
<ComicInfo xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Title>Harbor Lights</Title>
  <Series>Blue Harbor</Series>
  <Number>3</Number>
  <PageCount>24</PageCount>
  <LanguageISO>en</LanguageISO>
  <Summary>Ships &amp; storms</Summary>
  <Notes></Notes>
  <Pages>
    <Page Image="0" Type="FrontCover" />
  </Pages>
</ComicInfo>"#,
        )
        .expect("valid ComicInfo");

        assert_eq!(fields.get("title").map(String::as_str), Some("Harbor Lights"));
        assert_eq!(fields.get("series").map(String::as_str), Some("Blue Harbor"));
        assert_eq!(fields.get("page_count").map(String::as_str), Some("24"));
        assert_eq!(fields.get("language_iso").map(String::as_str), Some("en"));
        assert_eq!(fields.get("summary").map(String::as_str), Some("Ships & storms"));
        assert!(!fields.contains_key("notes"));
        assert!(!fields.contains_key("pages"));
        assert!(!fields.contains_key("page"));

        assert!(parse_comic_info("").is_err());
        assert!(parse_comic_info("<ComicInfo><Title>x</Series></ComicInfo>").is_err());
    }

    #[test]
    fn embedded_comic_info_wins_over_json_sidecar() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("scan 0042.cbz");
        write_zip(
            &path,
            &[
                ("01.png", png_bytes(6, 9, [30, 30, 30])),
                (
                    "ComicInfo.xml",
                    br#"<ComicInfo><Title>Deep Water</Title><Series>Blue Harbor</Series><Volume>2</Volume><Number>5</Number><Year>2021</Year><Genre>Drama, Sea</Genre></ComicInfo>"#
                        .to_vec(),
                ),
                (
                    "metadata.json",
                    br#"{"title": "Ignored Title", "writer": "R. Hale"}"#.to_vec(),
                ),
            ],
        );

        let metadata = extract_metadata(
            &path,
            ProcessingStrategy::Thorough,
            &ImportConfig::default(),
            &|_| {},
        )
        .expect("extraction");

        assert_eq!(metadata.title, "Deep Water");
        assert_eq!(metadata.name_info.series.as_deref(), Some("Blue Harbor"));
        assert_eq!(metadata.name_info.volume, Some(2));
        assert_eq!(metadata.name_info.issue, Some(5));
        assert_eq!(metadata.name_info.year, Some(2021));
        assert_eq!(metadata.custom_fields.get("writer").map(String::as_str), Some("R. Hale"));
        assert!(metadata.tags.starts_with(&["drama".to_string(), "sea".to_string()]));
        assert_eq!(metadata.page_count, 1);
        assert!(metadata.extraction_errors.is_empty());
    }

    #[test]
    fn sidecars_next_to_the_file_are_merged() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("Night Watch #12 (2020).cbz");
        write_zip(&path, &[("01.png", png_bytes(4, 4, [0, 0, 0]))]);

        fs::write(
            dir.path().join("Night Watch #12 (2020).xml"),
            "<ComicInfo><Publisher>Lantern House</Publisher><Number>13</Number></ComicInfo>",
        )
        .expect("Failed to write");
        fs::write(
            dir.path().join("Night Watch #12 (2020).json"),
            r#"{"publisher": "Not Used", "rating": 4}"#,
        )
        .expect("Failed to write");
        fs::write(dir.path().join("Night Watch #12 (2020).txt"), "  bought at the fair \n")
            .expect("Failed to write");
        fs::write(dir.path().join("series.json"), r#"{"status": "ongoing"}"#)
            .expect("Failed to write");
        fs::write(dir.path().join("collection.json"), "{ broken").expect("Failed to write");

        let metadata =
            extract_metadata(&path, ProcessingStrategy::Fast, &ImportConfig::default(), &|_| {})
                .expect("extraction");

        let field = |key: &str| metadata.custom_fields.get(key).map(String::as_str);
        assert_eq!(field("publisher"), Some("Lantern House"));
        assert_eq!(field("rating"), Some("4"));
        assert_eq!(field("notes"), Some("bought at the fair"));
        assert_eq!(field("status"), Some("ongoing"));
        assert_eq!(metadata.name_info.publisher.as_deref(), Some("Lantern House"));
        assert_eq!(metadata.name_info.issue, Some(13));
        assert_eq!(metadata.name_info.year, Some(2020));
        assert_eq!(metadata.extraction_errors.len(), 1);
        assert!(metadata.extraction_errors[0].starts_with("collection.json"));
    }

    #[test]
    fn cover_page_is_read_in_reading_order() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("order.cbz");
        write_zip(
            &path,
            &[
                ("p10.png", png_bytes(1, 1, [0, 0, 0])),
                ("p2.png", png_bytes(2, 1, [0, 0, 0])),
                ("notes.txt", b"hi".to_vec()),
            ],
        );

        let (name, bytes) = read_cover_page(&path, ArchiveFormat::Zip)
            .expect("read")
            .expect("cover");
        assert_eq!(name, "p2.png");
        assert_eq!(image_dimensions(&bytes).expect("dimensions"), (2, 1));
    }

    #[test]
    fn dominant_orientation_prefers_majority() {
        use Orientation::*;
        assert_eq!(dominant(&[Landscape, Portrait, Portrait]), Portrait);
        assert_eq!(dominant(&[Square, Square, Landscape]), Square);
        assert_eq!(dominant(&[]), Portrait);
    }
}

pub mod format;
pub mod reader;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{ImageFormat, ImageReader};

pub use format::{
    detect_archive_format, detect_document_kind, detect_from_bytes, is_image_name, ArchiveFormat,
    DocumentKind, IMAGE_EXTENSIONS,
};
use reader::{EntryHeader, EntryVisitor};

use crate::error::{Error, Result};

/// Progress sink receiving `processed / total` in `0.0..=1.0`.
pub type ProgressFn = dyn Fn(f32) + Send + Sync;

const MAX_FILE_NAME_LEN: usize = 255;
const UNSAFE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

/// Summary of an archive gathered without extracting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub format: ArchiveFormat,
    /// Regular files only; directories are not counted.
    pub entry_count: usize,
    pub total_size: u64,
    /// Heuristic: set when an encrypted entry is seen or the directory scan
    /// fails. Never set for the tar family.
    pub is_password_protected: bool,
    /// Archive size as a percentage of the uncompressed size.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub extracted_files: Vec<PathBuf>,
    /// Archive entry name of each extracted file, index-aligned with
    /// `extracted_files`.
    #[serde(default)]
    pub source_entries: Vec<String>,
    pub total_size: u64,
    pub checksum: String,
    pub errors: Vec<String>,
}

impl ExtractionResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn get_archive_info(path: &Path) -> ArchiveInfo {
    let format = detect_archive_format(path);
    let file_len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let mut info = ArchiveInfo {
        path: path.to_path_buf(),
        format,
        entry_count: 0,
        total_size: 0,
        is_password_protected: false,
        compression_ratio: 0.0,
    };
    if !format.is_known() {
        return info;
    }

    match reader::list_entries(path, format, None) {
        Ok(headers) => {
            for header in headers.iter().filter(|h| h.is_file()) {
                info.entry_count += 1;
                info.total_size = info.total_size.saturating_add(header.size);
            }
            info.is_password_protected = headers.iter().any(|h| h.encrypted);
        }
        Err(e) => {
            log::debug!("Archive scan failed for {}: {e}", path.display());
            info.is_password_protected = !format.is_tar_family();
        }
    }

    if info.total_size > 0 {
        info.compression_ratio = file_len as f64 / info.total_size as f64 * 100.0;
    }
    info
}

/// Normalize an archive entry name into a single safe file name.
///
/// Only the final path component survives, reserved characters become `_`
/// and the result is cut to 255 bytes on a character boundary.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized.rsplit('/').next().unwrap_or_default();
    let mut cleaned: String = last
        .chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect();

    if cleaned.len() > MAX_FILE_NAME_LEN {
        let mut cut = MAX_FILE_NAME_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    cleaned
}

/// Structural checksum over the extracted set: SHA-256 of every file name and
/// byte length, in name order. It identifies the shape of an extraction, not
/// the content of the files.
pub fn checksum(files: &[PathBuf]) -> String {
    let mut entries: Vec<(String, u64)> = files
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            (name, len)
        })
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (name, len) in &entries {
        hasher.update(name.as_bytes());
        hasher.update(len.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Header-only image check: the file must declare non-zero dimensions.
///
/// Extensions the decoder cannot read only need to be non-empty.
pub fn validate_image_file(path: &Path) -> bool {
    let readable = ImageFormat::from_path(path)
        .map(|f| f.reading_enabled())
        .unwrap_or(false);
    if !readable {
        return fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    }

    ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .ok()
        .and_then(|r| r.into_dimensions().ok())
        .map(|(width, height)| width > 0 && height > 0)
        .unwrap_or(false)
}

/// Extract `path` into `output_dir`.
///
/// With `validate_images`, only raster entries are materialized and each must
/// carry a readable header; other entries are skipped silently. Without it,
/// every regular file is written. Per-entry failures land in `errors` and the
/// walk continues.
pub fn extract_archive(
    path: &Path,
    output_dir: &Path,
    password: Option<&str>,
    on_progress: Option<&(dyn Fn(f32) + Send + Sync + '_)>,
    validate_images: bool,
) -> ExtractionResult {
    let format = detect_archive_format(path);
    if !format.is_known() {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        return ExtractionResult::failed(format!("Unsupported archive format: {ext}"));
    }

    if let Err(e) = fs::create_dir_all(output_dir) {
        return ExtractionResult::failed(format!("Failed to create output directory: {e}"));
    }

    let total = match reader::list_entries(path, format, password) {
        Ok(headers) => headers.iter().filter(|h| h.is_file()).count(),
        Err(e) => return ExtractionResult::failed(format!("Extraction failed: {e}")),
    };

    let mut sink = ExtractionSink {
        output_dir,
        validate_images,
        on_progress,
        total,
        processed: 0,
        names: HashSet::new(),
        files: Vec::new(),
        sources: Vec::new(),
        total_size: 0,
        errors: Vec::new(),
    };

    match reader::visit_entries(path, format, password, &mut sink) {
        Ok(()) => {}
        Err(Error::Corrupt(reason)) => {
            log::warn!("Archive {} ended early: {reason}", path.display());
            sink.errors.push(reason);
        }
        Err(e) => {
            sink.discard();
            return ExtractionResult::failed(format!("Extraction failed: {e}"));
        }
    }

    if total == 0 {
        if let Some(progress) = on_progress {
            progress(1.0);
        }
    }

    log::info!(
        "Extracted {} files ({} bytes) from {} with {} errors",
        sink.files.len(),
        sink.total_size,
        path.display(),
        sink.errors.len()
    );

    ExtractionResult {
        checksum: checksum(&sink.files),
        extracted_files: sink.files,
        source_entries: sink.sources,
        total_size: sink.total_size,
        errors: sink.errors,
    }
}

/// Run [`extract_archive`] on a blocking worker.
pub async fn extract_archive_async(
    path: PathBuf,
    output_dir: PathBuf,
    password: Option<String>,
    on_progress: Option<Arc<ProgressFn>>,
    validate_images: bool,
) -> Result<ExtractionResult> {
    let result = tokio::task::spawn_blocking(move || {
        extract_archive(
            &path,
            &output_dir,
            password.as_deref(),
            on_progress.as_deref(),
            validate_images,
        )
    })
    .await?;
    Ok(result)
}

struct ExtractionSink<'a> {
    output_dir: &'a Path,
    validate_images: bool,
    on_progress: Option<&'a (dyn Fn(f32) + Send + Sync + 'a)>,
    total: usize,
    processed: usize,
    names: HashSet<String>,
    files: Vec<PathBuf>,
    sources: Vec<String>,
    total_size: u64,
    errors: Vec<String>,
}

impl ExtractionSink<'_> {
    fn tick(&mut self) {
        self.processed += 1;
        if let Some(progress) = self.on_progress {
            let fraction = self.processed as f32 / self.total.max(1) as f32;
            progress(fraction.min(1.0));
        }
    }

    fn fail(&mut self, error: String) -> ControlFlow<()> {
        log::debug!("{error}");
        self.errors.push(error);
        self.tick();
        ControlFlow::Continue(())
    }

    fn write(&mut self, name: &str, data: &mut dyn Read) -> std::result::Result<(PathBuf, u64), String> {
        let out_path = self.output_dir.join(name);
        let mut out = File::create(&out_path)
            .map_err(|e| format!("Failed to create output file {name}: {e}"))?;
        match io::copy(data, &mut out) {
            Ok(written) => Ok((out_path, written)),
            Err(e) => {
                drop(out);
                let _ = fs::remove_file(&out_path);
                Err(format!("Failed to extract {name}: {e}"))
            }
        }
    }

    fn discard(&mut self) {
        for path in self.files.drain(..) {
            let _ = fs::remove_file(path);
        }
        self.sources.clear();
        self.total_size = 0;
    }
}

impl EntryVisitor for ExtractionSink<'_> {
    fn wants(&mut self, header: &EntryHeader) -> bool {
        if self.validate_images && !is_image_name(&header.name) {
            self.tick();
            return false;
        }
        true
    }

    fn entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> ControlFlow<()> {
        let name = sanitize_file_name(&header.name);
        if name.is_empty() || name == "." || name == ".." {
            return self.fail(format!("Invalid entry name: {}", header.name));
        }
        if !self.names.insert(name.clone()) {
            return self.fail(format!("Duplicate entry name after sanitizing: {}", header.name));
        }

        let (out_path, written) = match self.write(&name, data) {
            Ok(done) => done,
            Err(e) => return self.fail(e),
        };

        if self.validate_images && is_image_name(&name) && !validate_image_file(&out_path) {
            let _ = fs::remove_file(&out_path);
            return self.fail(format!("Corrupted image: {}", header.name));
        }

        self.files.push(out_path);
        self.sources.push(header.name.clone());
        self.total_size = self.total_size.saturating_add(written);
        self.tick();
        ControlFlow::Continue(())
    }

    fn entry_error(&mut self, _name: &str, error: String) -> ControlFlow<()> {
        self.fail(error)
    }
}

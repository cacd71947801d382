use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use sevenz_rust::{Password, SevenZArchiveEntry, SevenZReader};
use tar::Archive as TarArchive;
use unrar::Archive as RarArchive;
use zip::ZipArchive;

use super::format::ArchiveFormat;
use crate::error::{Error, Result};

pub(crate) const MAX_ENTRIES: usize = 100_000;
pub(crate) const MAX_TOTAL_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub(crate) const MAX_SINGLE_FILE: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks and hard links. Never materialized.
    Link,
}

/// One archive member as declared by the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
    pub encrypted: bool,
}

impl EntryHeader {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Receives archive entries in container order.
///
/// Only regular files reach `entry`. Returning `ControlFlow::Break` stops the
/// walk without an error.
pub trait EntryVisitor {
    /// Whether the entry's bytes are needed. Declined entries are skipped
    /// without decompressing where the format allows it.
    fn wants(&mut self, _header: &EntryHeader) -> bool {
        true
    }

    fn entry(&mut self, header: &EntryHeader, data: &mut dyn Read) -> ControlFlow<()>;

    fn entry_error(&mut self, name: &str, error: String) -> ControlFlow<()>;
}

/// Running limit checks shared by listing and visiting.
#[derive(Default)]
struct Limits {
    entries: usize,
    total_size: u64,
}

impl Limits {
    fn admit(&mut self, header: &EntryHeader) -> std::result::Result<(), String> {
        self.entries += 1;
        if self.entries > MAX_ENTRIES {
            return Err("Archive contains too many entries".to_string());
        }
        if header.is_file() {
            self.total_size = self.total_size.saturating_add(header.size);
            if self.total_size > MAX_TOTAL_SIZE {
                return Err("Archive exceeds size limit".to_string());
            }
        }
        Ok(())
    }
}

/// Read every entry header without extracting anything.
///
/// Fails when the container cannot be opened or its directory cannot be read;
/// callers treat that as a hint the archive is encrypted.
pub fn list_entries(
    archive_path: &Path,
    format: ArchiveFormat,
    password: Option<&str>,
) -> Result<Vec<EntryHeader>> {
    let mut headers = Vec::new();
    let mut limits = Limits::default();
    let mut push = |header: EntryHeader| -> Result<()> {
        limits
            .admit(&header)
            .map_err(|reason| Error::archive_open(archive_path, reason))?;
        headers.push(header);
        Ok(())
    };

    match format {
        ArchiveFormat::Zip => {
            let mut archive = open_zip(archive_path)?;
            for i in 0..archive.len() {
                // Raw access reads the local header without requiring the password.
                let entry = archive
                    .by_index_raw(i)
                    .map_err(|e| Error::archive_open(archive_path, format!("Failed to read zip entry: {e}")))?;
                push(EntryHeader {
                    name: entry.name().to_string(),
                    size: entry.size(),
                    kind: zip_kind(entry.is_dir(), entry.is_symlink()),
                    encrypted: entry.encrypted(),
                })?;
            }
        }
        ArchiveFormat::Rar | ArchiveFormat::Rar5 => {
            let archive = match password {
                Some(pw) => RarArchive::with_password(archive_path, pw),
                None => RarArchive::new(archive_path),
            }
            .open_for_listing()
            .map_err(|e| Error::archive_open(archive_path, format!("Failed to open RAR archive: {e}")))?;

            for header_result in archive {
                let header = header_result
                    .map_err(|e| Error::archive_open(archive_path, format!("Failed to read RAR entry: {e}")))?;
                push(EntryHeader {
                    name: header.filename.to_string_lossy().to_string(),
                    size: header.unpacked_size,
                    kind: if header.is_directory() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    encrypted: header.is_encrypted(),
                })?;
            }
        }
        ArchiveFormat::SevenZip => {
            let reader = open_sevenz(archive_path, password)?;
            for entry in &reader.archive().files {
                push(sevenz_header(entry))?;
            }
        }
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 => {
            let reader = create_tar_reader(format, archive_path)?;
            let mut archive = TarArchive::new(reader);
            let entries = archive
                .entries()
                .map_err(|e| Error::archive_open(archive_path, format!("Failed to read tar entries: {e}")))?;

            for entry_result in entries {
                let entry = entry_result
                    .map_err(|e| Error::archive_open(archive_path, format!("Failed to read tar entry: {e}")))?;
                push(tar_header(&entry)?)?;
            }
        }
        ArchiveFormat::Unknown => return Err(Error::UnsupportedFormat(archive_path.to_path_buf())),
    }

    Ok(headers)
}

/// Stream every entry of the archive through `visitor`, in container order.
///
/// `Err(ArchiveOpen)` means nothing was read. `Err(Corrupt)` means the stream
/// broke part way; entries already delivered stay valid.
pub fn visit_entries(
    archive_path: &Path,
    format: ArchiveFormat,
    password: Option<&str>,
    visitor: &mut dyn EntryVisitor,
) -> Result<()> {
    match format {
        ArchiveFormat::Zip => visit_zip(archive_path, password, visitor),
        ArchiveFormat::Rar | ArchiveFormat::Rar5 => visit_rar(archive_path, password, visitor),
        ArchiveFormat::SevenZip => visit_sevenz(archive_path, password, visitor),
        ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 => {
            visit_tar(archive_path, format, visitor)
        }
        ArchiveFormat::Unknown => Err(Error::UnsupportedFormat(archive_path.to_path_buf())),
    }
}

/// Decide what happens to a regular file before its bytes are touched.
/// `Some(flow)` means the entry is not handed to the visitor.
fn screen(
    header: &EntryHeader,
    limits: &mut Limits,
    visitor: &mut dyn EntryVisitor,
) -> Result<Option<ControlFlow<()>>> {
    limits.admit(header).map_err(Error::Corrupt)?;
    match header.kind {
        EntryKind::Directory => return Ok(Some(ControlFlow::Continue(()))),
        EntryKind::Link => {
            log::debug!("Skipping link entry {}", header.name);
            return Ok(Some(ControlFlow::Continue(())));
        }
        EntryKind::File => {}
    }
    if !visitor.wants(header) {
        return Ok(Some(ControlFlow::Continue(())));
    }
    if header.size > MAX_SINGLE_FILE {
        return Ok(Some(visitor.entry_error(
            &header.name,
            format!("Archive entry too large: {}", header.name),
        )));
    }
    Ok(None)
}

/// Hand an entry to the visitor, then consume whatever it left unread so the
/// next entry starts at the right offset.
fn deliver(header: &EntryHeader, data: &mut dyn Read, visitor: &mut dyn EntryVisitor) -> io::Result<ControlFlow<()>> {
    let mut limited = data.take(MAX_SINGLE_FILE);
    let flow = visitor.entry(header, &mut limited);
    io::copy(&mut limited, &mut io::sink())?;
    Ok(flow)
}

fn open_zip(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive_path).map_err(|e| Error::archive_open(archive_path, e))?;
    ZipArchive::new(file)
        .map_err(|e| Error::archive_open(archive_path, format!("Failed to read zip archive: {e}")))
}

fn zip_kind(is_dir: bool, is_symlink: bool) -> EntryKind {
    if is_dir {
        EntryKind::Directory
    } else if is_symlink {
        EntryKind::Link
    } else {
        EntryKind::File
    }
}

fn visit_zip(
    archive_path: &Path,
    password: Option<&str>,
    visitor: &mut dyn EntryVisitor,
) -> Result<()> {
    let mut archive = open_zip(archive_path)?;
    let mut limits = Limits::default();

    for i in 0..archive.len() {
        let header = {
            let raw = archive
                .by_index_raw(i)
                .map_err(|e| Error::Corrupt(format!("Failed to read zip entry {i}: {e}")))?;
            EntryHeader {
                name: raw.name().to_string(),
                size: raw.size(),
                kind: zip_kind(raw.is_dir(), raw.is_symlink()),
                encrypted: raw.encrypted(),
            }
        };
        if let Some(flow) = screen(&header, &mut limits, visitor)? {
            if flow.is_break() {
                return Ok(());
            }
            continue;
        }

        let opened = match password {
            Some(pw) => archive.by_index_decrypt(i, pw.as_bytes()),
            None => archive.by_index(i),
        };
        let flow = match opened {
            Ok(mut entry) => match deliver(&header, &mut entry, visitor) {
                Ok(flow) => flow,
                Err(e) => visitor.entry_error(&header.name, format!("Failed to read {}: {e}", header.name)),
            },
            Err(e) => visitor.entry_error(&header.name, format!("Failed to open {}: {e}", header.name)),
        };
        if flow.is_break() {
            return Ok(());
        }
    }
    Ok(())
}

fn visit_rar(
    archive_path: &Path,
    password: Option<&str>,
    visitor: &mut dyn EntryVisitor,
) -> Result<()> {
    let mut archive = match password {
        Some(pw) => RarArchive::with_password(archive_path, pw),
        None => RarArchive::new(archive_path),
    }
    .open_for_processing()
    .map_err(|e| Error::archive_open(archive_path, format!("Failed to open RAR archive: {e}")))?;
    let mut limits = Limits::default();

    loop {
        let header = match archive.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) => return Err(Error::Corrupt(format!("Failed to read RAR entry: {e}"))),
        };
        let entry = header.entry();
        let entry_header = EntryHeader {
            name: entry.filename.to_string_lossy().to_string(),
            size: entry.unpacked_size,
            kind: if entry.is_directory() {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            encrypted: entry.is_encrypted(),
        };

        if let Some(flow) = screen(&entry_header, &mut limits, visitor)? {
            archive = header
                .skip()
                .map_err(|e| Error::Corrupt(format!("Failed to skip RAR entry: {e}")))?;
            if flow.is_break() {
                return Ok(());
            }
            continue;
        }

        // A failed read consumes the handle, so the rest of the archive is lost.
        let (data, next) = header
            .read()
            .map_err(|e| Error::Corrupt(format!("Failed to extract {}: {e}", entry_header.name)))?;
        archive = next;
        let flow = match deliver(&entry_header, &mut data.as_slice(), visitor) {
            Ok(flow) => flow,
            Err(e) => visitor.entry_error(&entry_header.name, e.to_string()),
        };
        if flow.is_break() {
            return Ok(());
        }
    }
    Ok(())
}

fn open_sevenz(archive_path: &Path, password: Option<&str>) -> Result<SevenZReader<File>> {
    let password = password.map(Password::from).unwrap_or_else(Password::empty);
    SevenZReader::open(archive_path, password)
        .map_err(|e| Error::archive_open(archive_path, format!("Failed to open 7z archive: {e}")))
}

fn sevenz_header(entry: &SevenZArchiveEntry) -> EntryHeader {
    EntryHeader {
        name: entry.name().to_string(),
        size: entry.size(),
        kind: if entry.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        encrypted: false,
    }
}

fn visit_sevenz(
    archive_path: &Path,
    password: Option<&str>,
    visitor: &mut dyn EntryVisitor,
) -> Result<()> {
    let mut reader = open_sevenz(archive_path, password)?;
    let mut limits = Limits::default();
    let mut fatal: Option<Error> = None;

    let walked = reader.for_each_entries(|entry, data| {
        let header = sevenz_header(entry);
        let flow = match screen(&header, &mut limits, visitor) {
            Ok(Some(flow)) => {
                // Solid blocks decode sequentially; skipped bytes still have to be read.
                io::copy(data, &mut io::sink()).map_err(sevenz_rust::Error::from)?;
                flow
            }
            Ok(None) => match deliver(&header, data, visitor) {
                Ok(flow) => flow,
                Err(e) => return Err(sevenz_rust::Error::from(e)),
            },
            Err(e) => {
                fatal = Some(e);
                return Ok(false);
            }
        };
        Ok(flow.is_continue())
    });

    if let Some(e) = fatal {
        return Err(e);
    }
    walked.map_err(|e| Error::Corrupt(format!("Failed to read 7z entry: {e}")))
}

fn tar_header<R: Read>(entry: &tar::Entry<'_, R>) -> Result<EntryHeader> {
    let path = entry
        .path()
        .map_err(|e| Error::Corrupt(format!("Failed to read tar entry path: {e}")))?;
    let header = entry.header();
    let entry_type = header.entry_type();
    let kind = if entry_type.is_symlink() || entry_type.is_hard_link() {
        EntryKind::Link
    } else if entry_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    Ok(EntryHeader {
        name: path.to_string_lossy().to_string(),
        size: header.size().unwrap_or(0),
        kind,
        encrypted: false,
    })
}

fn visit_tar(
    archive_path: &Path,
    format: ArchiveFormat,
    visitor: &mut dyn EntryVisitor,
) -> Result<()> {
    let reader = create_tar_reader(format, archive_path)?;
    let mut archive = TarArchive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::archive_open(archive_path, format!("Failed to read tar entries: {e}")))?;
    let mut limits = Limits::default();

    for entry_result in entries {
        let mut entry =
            entry_result.map_err(|e| Error::Corrupt(format!("Failed to read tar entry: {e}")))?;
        let header = tar_header(&entry)?;
        // Skipped tar entries are stepped over by the iterator.
        if let Some(flow) = screen(&header, &mut limits, visitor)? {
            if flow.is_break() {
                return Ok(());
            }
            continue;
        }
        let flow = match deliver(&header, &mut entry, visitor) {
            Ok(flow) => flow,
            Err(e) => visitor.entry_error(&header.name, format!("Failed to read {}: {e}", header.name)),
        };
        if flow.is_break() {
            return Ok(());
        }
    }
    Ok(())
}

fn create_tar_reader(format: ArchiveFormat, archive_path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(archive_path).map_err(|e| Error::archive_open(archive_path, e))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        other => {
            return Err(Error::archive_open(
                archive_path,
                format!("Invalid tar archive format: {other}"),
            ))
        }
    };
    Ok(reader)
}

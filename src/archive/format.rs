use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const HEADER_LEN: usize = 16;

const ZIP_MAGIC: &[u8] = &[0x50, 0x4B];
const RAR_MAGIC: &[u8] = &[0x52, 0x61, 0x72, 0x21];
const RAR5_TAIL: &[u8] = &[0x1A, 0x07, 0x01, 0x00];
const SEVEN_ZIP_MAGIC: &[u8] = &[0x37, 0x7A];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = &[0x42, 0x5A];
const PDF_MAGIC: &[u8] = b"%PDF";

/// Raster extensions accepted as comic pages.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "avif", "heif", "heic",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    Rar5,
    SevenZip,
    TarGz,
    TarBz2,
    Tar,
    Unknown,
}

impl ArchiveFormat {
    pub fn is_known(self) -> bool {
        self != ArchiveFormat::Unknown
    }

    pub fn is_tar_family(self) -> bool {
        matches!(
            self,
            ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2
        )
    }

    pub fn is_rar_family(self) -> bool {
        matches!(self, ArchiveFormat::Rar | ArchiveFormat::Rar5)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::Rar5 => "rar5",
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What a file can be opened as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    Archive(ArchiveFormat),
    Pdf,
    Unsupported,
}

/// Classify an archive by its leading bytes. Any read error yields `Unknown`.
pub fn detect_archive_format(path: &Path) -> ArchiveFormat {
    let header = match read_header(path) {
        Some(header) => header,
        None => return ArchiveFormat::Unknown,
    };
    detect_from_bytes(&header, &extension_lower(path))
}

/// Byte-level classification. `extension` is only consulted for plain tar,
/// which has no magic at offset 0.
pub fn detect_from_bytes(header: &[u8], extension: &str) -> ArchiveFormat {
    if header.starts_with(ZIP_MAGIC) {
        ArchiveFormat::Zip
    } else if header.starts_with(RAR_MAGIC) {
        if header[RAR_MAGIC.len()..].starts_with(RAR5_TAIL) {
            ArchiveFormat::Rar5
        } else {
            ArchiveFormat::Rar
        }
    } else if header.starts_with(SEVEN_ZIP_MAGIC) {
        ArchiveFormat::SevenZip
    } else if header.starts_with(GZIP_MAGIC) {
        ArchiveFormat::TarGz
    } else if header.starts_with(BZIP2_MAGIC) {
        ArchiveFormat::TarBz2
    } else if extension.eq_ignore_ascii_case("tar") {
        ArchiveFormat::Tar
    } else {
        ArchiveFormat::Unknown
    }
}

pub fn detect_document_kind(path: &Path) -> DocumentKind {
    let header = read_header(path).unwrap_or_default();
    let extension = extension_lower(path);

    if header.starts_with(PDF_MAGIC) || extension == "pdf" {
        return DocumentKind::Pdf;
    }

    match detect_from_bytes(&header, &extension) {
        ArchiveFormat::Unknown => DocumentKind::Unsupported,
        format => DocumentKind::Archive(format),
    }
}

/// Whether an entry name carries a known raster extension.
pub fn is_image_name(name: &str) -> bool {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return false,
    };
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

fn read_header(path: &Path) -> Option<Vec<u8>> {
    let file = File::open(path).ok()?;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64).read_to_end(&mut header).ok()?;
    Some(header)
}

fn extension_lower(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

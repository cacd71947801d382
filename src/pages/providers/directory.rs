use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::archive::{extract_archive, is_image_name};
use crate::error::{Error, Result};
use crate::pages::{decode_image_file, natural_cmp, PageProvider};

#[derive(Debug, Clone)]
struct PageFile {
    path: PathBuf,
    /// Ordering key: the archive entry name, or the file name for folders.
    name: String,
}

/// Pages as loose image files, either an existing folder or an archive
/// unpacked into a scratch directory that lives as long as the provider.
pub struct DirectoryPageProvider {
    pages: Vec<PageFile>,
    _scratch: Option<TempDir>,
}

impl DirectoryPageProvider {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut pages = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if is_image_name(&name) {
                pages.push(PageFile { path, name });
            }
        }
        Ok(Self::with_pages(pages, None))
    }

    /// Unpack an archive the engine cannot read randomly (rar, 7z, tar).
    ///
    /// Pages are ordered by their entry names inside the archive, so folders
    /// read as consecutive chapters.
    pub fn from_archive(path: &Path, password: Option<&str>) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("comicat-pages-").tempdir()?;
        let result = extract_archive(path, scratch.path(), password, None, true);

        if result.extracted_files.is_empty() && !result.errors.is_empty() {
            return Err(Error::archive_open(path, result.errors.join("; ")));
        }
        for error in &result.errors {
            log::warn!("{}: {error}", path.display());
        }

        let pages = result
            .extracted_files
            .into_iter()
            .zip(result.source_entries)
            .map(|(path, name)| PageFile { path, name })
            .collect();
        Ok(Self::with_pages(pages, Some(scratch)))
    }

    fn with_pages(mut pages: Vec<PageFile>, scratch: Option<TempDir>) -> Self {
        pages.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        Self {
            pages,
            _scratch: scratch,
        }
    }

    pub fn page_paths(&self) -> impl Iterator<Item = &Path> {
        self.pages.iter().map(|p| p.path.as_path())
    }
}

impl PageProvider for DirectoryPageProvider {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn get_page(&self, index: usize) -> Option<DynamicImage> {
        let Some(page) = self.pages.get(index) else {
            log::debug!(
                "Page {index} out of range for directory provider ({} pages)",
                self.pages.len()
            );
            return None;
        };
        match decode_image_file(&page.path) {
            Ok(image) => Some(image),
            Err(e) => {
                log::warn!("Failed to decode page {index} at {}: {e}", page.path.display());
                None
            }
        }
    }

    fn page_names(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.name.clone()).collect()
    }

    fn kind(&self) -> &'static str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs::File;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([90, 90, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)
            .expect("Failed to encode png");
        buf.into_inner()
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, Vec<u8>)]) {
        let file = File::create(path).expect("Failed to create tar.gz");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
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
    fn archive_pages_follow_entry_names() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("chapters.tar.gz");
        write_tar_gz(
            &path,
            &[
                ("b/1.png", png(5, 4)),
                ("a/2.png", png(3, 2)),
                ("a/10.png", png(7, 2)),
                ("b/broken.png", b"not a png".to_vec()),
            ],
        );

        let provider = DirectoryPageProvider::from_archive(&path, None).expect("provider");
        assert_eq!(provider.page_names(), vec!["a/2.png", "a/10.png", "b/1.png"]);

        let first = provider.get_page(0).expect("page 0");
        assert_eq!((first.width(), first.height()), (3, 2));
        let last = provider.get_page(2).expect("page 2");
        assert_eq!((last.width(), last.height()), (5, 4));
        assert!(provider.get_page(3).is_none());
    }

    #[test]
    fn folder_pages_use_file_names() {
        let dir = tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join("p10.png"), png(1, 1)).expect("Failed to write");
        fs::write(dir.path().join("p9.png"), png(1, 1)).expect("Failed to write");
        fs::write(dir.path().join("readme.txt"), b"hi").expect("Failed to write");

        let provider = DirectoryPageProvider::from_dir(dir.path()).expect("provider");
        assert_eq!(provider.page_names(), vec!["p9.png", "p10.png"]);
        assert_eq!(provider.page_paths().count(), 2);
    }
}

use image::DynamicImage;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zip::ZipArchive;

use crate::archive::is_image_name;
use crate::archive::reader::MAX_SINGLE_FILE;
use crate::error::{Error, Result};
use crate::pages::{decode_image_bytes, natural_cmp, PageProvider};

#[derive(Debug, Clone)]
struct PageEntry {
    index: usize,
    name: String,
}

/// Pages read straight out of an open zip container, one entry per page.
pub struct ContainerPageProvider {
    path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
    pages: Vec<PageEntry>,
    password: Option<String>,
}

impl ContainerPageProvider {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::archive_open(path, e))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| Error::archive_open(path, format!("Failed to read zip archive: {e}")))?;

        let mut pages = Vec::new();
        for index in 0..archive.len() {
            let entry = match archive.by_index_raw(index) {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("Skipping unreadable entry {index} in {}: {e}", path.display());
                    continue;
                }
            };
            if entry.is_dir() || entry.is_symlink() || !is_image_name(entry.name()) {
                continue;
            }
            pages.push(PageEntry {
                index,
                name: entry.name().to_string(),
            });
        }
        pages.sort_by(|a, b| natural_cmp(&a.name, &b.name));

        Ok(Self {
            path: path.to_path_buf(),
            archive: Mutex::new(archive),
            pages,
            password: password.map(str::to_string),
        })
    }

    /// Entry name of the page at `index`, in page order.
    pub fn page_name(&self, index: usize) -> Option<&str> {
        self.pages.get(index).map(|p| p.name.as_str())
    }

    fn read_page_bytes(&self, entry: &PageEntry) -> Result<Vec<u8>> {
        let mut archive = self
            .archive
            .lock()
            .map_err(|_| Error::Corrupt("container lock poisoned".to_string()))?;
        let mut file = match &self.password {
            Some(pw) => archive.by_index_decrypt(entry.index, pw.as_bytes()),
            None => archive.by_index(entry.index),
        }
        .map_err(|e| Error::Corrupt(format!("Failed to open {}: {e}", entry.name)))?;

        if file.size() > MAX_SINGLE_FILE {
            return Err(Error::Corrupt(format!("Archive entry too large: {}", entry.name)));
        }
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl PageProvider for ContainerPageProvider {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn get_page(&self, index: usize) -> Option<DynamicImage> {
        let entry = match self.pages.get(index) {
            Some(entry) => entry,
            None => {
                log::debug!(
                    "Page {index} out of range for {} ({} pages)",
                    self.path.display(),
                    self.pages.len()
                );
                return None;
            }
        };

        let decoded = self
            .read_page_bytes(entry)
            .and_then(|bytes| decode_image_bytes(&bytes));
        match decoded {
            Ok(image) => Some(image),
            Err(e) => {
                log::warn!("Failed to load page {index} ({}) of {}: {e}", entry.name, self.path.display());
                None
            }
        }
    }

    fn page_names(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.name.clone()).collect()
    }

    fn kind(&self) -> &'static str {
        "container"
    }
}

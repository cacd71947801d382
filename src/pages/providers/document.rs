use image::{DynamicImage, RgbImage};
use mupdf::{Colorspace, Document, Matrix};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pages::PageProvider;

struct RenderRequest {
    index: usize,
    reply: mpsc::Sender<Result<DynamicImage>>,
}

/// Pages rendered from a paginated document (PDF).
///
/// MuPDF handles cannot leave the thread that opened them, so the document
/// lives on a dedicated render thread and pages are requested over a channel.
/// The thread exits once the provider is dropped.
pub struct DocumentPageProvider {
    path: PathBuf,
    requests: mpsc::Sender<RenderRequest>,
    page_count: usize,
    decode_timeout: Duration,
}

impl DocumentPageProvider {
    pub fn open(path: &Path, open_timeout: Duration, decode_timeout: Duration) -> Result<Self> {
        let (requests, receiver) = mpsc::channel::<RenderRequest>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<usize>>();
        let doc_path = path.to_path_buf();

        thread::Builder::new()
            .name("comicat-render".to_string())
            .spawn(move || render_loop(doc_path, receiver, ready_tx))?;

        let page_count = match ready_rx.recv_timeout(open_timeout) {
            Ok(count) => count?,
            Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout(open_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Render("render thread exited during open".to_string()))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            requests,
            page_count,
            decode_timeout,
        })
    }

    fn request_page(&self, index: usize) -> Result<DynamicImage> {
        let (reply, response) = mpsc::channel();
        self.requests
            .send(RenderRequest { index, reply })
            .map_err(|_| Error::Render("render thread is gone".to_string()))?;
        match response.recv_timeout(self.decode_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(self.decode_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Render("render thread dropped the request".to_string()))
            }
        }
    }
}

impl PageProvider for DocumentPageProvider {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn get_page(&self, index: usize) -> Option<DynamicImage> {
        if index >= self.page_count {
            log::debug!("Page {index} out of range for {}", self.path.display());
            return None;
        }
        match self.request_page(index) {
            Ok(image) => Some(image),
            Err(e) => {
                log::warn!("Failed to render page {index} of {}: {e}", self.path.display());
                None
            }
        }
    }

    fn kind(&self) -> &'static str {
        "document"
    }
}

pub(crate) fn open_document(path: &Path) -> Result<Document> {
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::Render(format!("Non UTF-8 document path: {}", path.display())))?;
    Document::open(path_str).map_err(|e| Error::Render(format!("Failed to open document: {e:?}")))
}

pub(crate) fn document_page_count(document: &Document) -> Result<usize> {
    let count = document
        .page_count()
        .map_err(|e| Error::Render(format!("Failed to count pages: {e:?}")))?;
    Ok(count.max(0) as usize)
}

fn render_loop(
    path: PathBuf,
    requests: mpsc::Receiver<RenderRequest>,
    ready: mpsc::Sender<Result<usize>>,
) {
    let opened = open_document(&path).and_then(|doc| {
        let count = document_page_count(&doc)?;
        Ok((doc, count))
    });
    let document = match opened {
        Ok((document, count)) => {
            if ready.send(Ok(count)).is_err() {
                return;
            }
            document
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    for request in requests {
        let _ = request.reply.send(render_page(&document, request.index));
    }
    log::debug!("Render thread for {} finished", path.display());
}

/// Render one page at its native size (scale 1.0) as opaque RGB.
pub(crate) fn render_page(document: &Document, index: usize) -> Result<DynamicImage> {
    let page = document
        .load_page(index as i32)
        .map_err(|e| Error::Render(format!("Failed to load page {index}: {e:?}")))?;

    let matrix = Matrix::new_scale(1.0, 1.0);
    let pixmap = page
        .to_pixmap(&matrix, &Colorspace::device_rgb(), false, true)
        .map_err(|e| Error::Render(format!("Failed to render page {index}: {e:?}")))?;

    let width = pixmap.width() as u32;
    let height = pixmap.height() as u32;
    let stride = pixmap.stride() as usize;
    let n = pixmap.n() as usize;
    let samples = pixmap.samples();

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as usize {
        for x in 0..width as usize {
            let offset = y * stride + x * n;
            match n {
                1 => {
                    let gray = samples[offset];
                    rgb.extend_from_slice(&[gray, gray, gray]);
                }
                3 | 4 => rgb.extend_from_slice(&samples[offset..offset + 3]),
                _ => {
                    return Err(Error::Render(format!(
                        "Unsupported pixel format with {n} components"
                    )))
                }
            }
        }
    }

    let image = RgbImage::from_vec(width, height, rgb)
        .ok_or_else(|| Error::Render("Pixmap size does not match its samples".to_string()))?;
    Ok(DynamicImage::ImageRgb8(image))
}

//! Preview images stored alongside an object.

use bytes::Bytes;

/// Produces the preview image stored with an upload, if any.
pub trait PreviewSource: Send + Sync + 'static {
    /// Preview bytes for an object of `content_type`, or `None` to store the
    /// no-preview marker.
    fn preview_for(&self, content_type: Option<&str>, data: &Bytes) -> Option<Bytes>;
}

/// Small images are their own preview. Everything else gets none.
#[derive(Debug, Clone)]
pub struct InlineImagePreview {
    pub max_bytes: usize,
}

impl Default for InlineImagePreview {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

impl PreviewSource for InlineImagePreview {
    fn preview_for(&self, content_type: Option<&str>, data: &Bytes) -> Option<Bytes> {
        let is_image = content_type.is_some_and(|ct| ct.starts_with("image/"));
        (is_image && !data.is_empty() && data.len() <= self.max_bytes).then(|| data.clone())
    }
}

/// File name a preview is attached under, e.g. `preview.png`.
pub fn preview_filename(content_type: Option<&str>) -> String {
    let ext = content_type
        .and_then(mime_guess::get_mime_extensions_str)
        .and_then(|exts| exts.first())
        .copied()
        .unwrap_or("bin");
    format!("preview.{ext}")
}

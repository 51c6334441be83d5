//! Pages, and the input records that describe them.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat};
use schemars::JsonSchema;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    data_url::data_url, prelude::*, recognition::BoundingBox,
};

/// One unit of recognition work: a decoded image, any text that was already
/// embedded in the source file, or both.
///
/// Pages are immutable once created. We share them between concurrently
/// running engines using an `Arc`.
#[derive(Debug)]
pub struct Page {
    /// The index of this page within its document.
    pub index: usize,

    /// The decoded page image, if we have one.
    pub image: Option<DynamicImage>,

    /// Text extracted from the source file without OCR, if any.
    pub embedded_text: Option<String>,
}

impl Page {
    /// Create a new page.
    pub fn new(
        index: usize,
        image: Option<DynamicImage>,
        embedded_text: Option<String>,
    ) -> Self {
        Self {
            index,
            image,
            embedded_text,
        }
    }

    /// Page dimensions in pixels, or `(0, 0)` for text-only pages.
    pub fn dimensions(&self) -> (u32, u32) {
        match &self.image {
            Some(image) => (image.width(), image.height()),
            None => (0, 0),
        }
    }

    /// The number of pixels on this page.
    pub fn pixel_count(&self) -> u64 {
        let (w, h) = self.dimensions();
        u64::from(w) * u64::from(h)
    }

    /// A box covering the whole page.
    pub fn full_page_box(&self) -> BoundingBox {
        let (w, h) = self.dimensions();
        BoundingBox::full_page(w, h)
    }

    /// Embedded text, if it contains anything other than whitespace.
    pub fn non_blank_embedded_text(&self) -> Option<&str> {
        self.embedded_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    /// Encode our image as PNG.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("page {} has no image data", self.index))?;
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .with_context(|| format!("cannot encode page {} as PNG", self.index))?;
        Ok(png.into_inner())
    }

    /// Convert our image to a PNG `data:` URL.
    pub fn to_data_url(&self) -> Result<String> {
        Ok(data_url("image/png", &self.to_png()?))
    }
}

/// An input record describing one document to recognize.
///
/// Either `path` (a single-page image or text file) or `pages` must be given.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DocumentInput {
    /// The ID of the record. Copied to the output.
    pub id: Value,

    /// Shorthand for a single-page document stored in one file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Already-extracted pages, in order.
    #[serde(default)]
    pub pages: Vec<PageInput>,
}

/// An input record describing one page.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PageInput {
    /// Path to a page image (PNG, JPEG or TIFF).
    #[serde(default)]
    pub image: Option<PathBuf>,

    /// Text embedded in the original file, if any.
    #[serde(default)]
    pub text: Option<String>,

    /// Path to a UTF-8 file containing embedded text.
    #[serde(default)]
    pub text_path: Option<PathBuf>,
}

impl DocumentInput {
    /// Load and decode all our pages.
    #[instrument(level = "debug", skip_all, fields(id = %self.id))]
    pub async fn load_pages(&self) -> Result<Vec<Page>> {
        if self.path.is_some() && !self.pages.is_empty() {
            return Err(anyhow!("specify either `path` or `pages`, not both"));
        }
        if let Some(path) = &self.path {
            let path = path.clone();
            let page = spawn_blocking_propagating_panics(move || {
                load_single_file_page(&path)
            })
            .await?;
            return Ok(vec![page]);
        }
        if self.pages.is_empty() {
            return Err(anyhow!("document has no pages"));
        }

        let mut pages = Vec::with_capacity(self.pages.len());
        for (index, page_input) in self.pages.iter().enumerate() {
            let image_path = page_input.image.clone();
            let image = match image_path {
                Some(path) => Some(
                    spawn_blocking_propagating_panics(move || load_image(&path))
                        .await?,
                ),
                None => None,
            };
            let embedded_text = match (&page_input.text, &page_input.text_path) {
                (Some(_), Some(_)) => {
                    return Err(anyhow!(
                        "page {index}: specify either `text` or `text_path`, not both"
                    ));
                }
                (Some(text), None) => Some(text.clone()),
                (None, Some(path)) => Some(
                    tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("cannot read text from {path:?}"))?,
                ),
                (None, None) => None,
            };
            if image.is_none() && embedded_text.is_none() {
                return Err(anyhow!("page {index} has neither an image nor text"));
            }
            pages.push(Page::new(index, image, embedded_text));
        }
        Ok(pages)
    }
}

/// Load a page image from disk.
fn load_image(path: &Path) -> Result<DynamicImage> {
    let data =
        std::fs::read(path).with_context(|| format!("cannot read image {path:?}"))?;
    image::load_from_memory(&data).with_context(|| format!("cannot decode image {path:?}"))
}

/// Load a single-page document, sniffing the file type from its contents.
pub(crate) fn load_single_file_page(path: &Path) -> Result<Page> {
    let data = std::fs::read(path).with_context(|| format!("cannot read {path:?}"))?;
    match infer::get(&data).map(|kind| kind.mime_type()) {
        Some(mime_type) if mime_type.starts_with("image/") => {
            let image = image::load_from_memory(&data)
                .with_context(|| format!("cannot decode {mime_type} image {path:?}"))?;
            Ok(Page::new(0, Some(image), None))
        }
        Some(mime_type) => Err(anyhow!(
            "{path:?} is {mime_type}; convert it to page images or text first"
        )),
        None => {
            let text = String::from_utf8(data)
                .with_context(|| format!("{path:?} is neither an image nor UTF-8 text"))?;
            Ok(Page::new(0, None, Some(text)))
        }
    }
}

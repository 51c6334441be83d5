//! Tesseract OCR engine.

use std::sync::Arc;

use schemars::JsonSchema;
use tokio::{process::Command, time::Instant};

use crate::{
    async_utils::{
        TESSERACT_ERROR_REGEX, check_for_command_failure, spawn_blocking_propagating_panics,
    },
    page::Page,
    prelude::*,
    recognition::{BoundingBox, TextBlock},
};

use super::{CommonEngineSettings, EngineAdapter, EngineCapability, EngineKind, Fitness};

/// Tesseract is good at clean print, and not much else.
const DEFAULT_FITNESS: Fitness = Fitness {
    printed: 0.9,
    handwritten: 0.2,
    mixed: 0.6,
    structured: 0.4,
};

/// Settings for [`TesseractAdapter`].
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TesseractSettings {
    #[serde(flatten)]
    pub common: CommonEngineSettings,

    /// Tesseract language code(s), such as `eng` or `eng+deu`.
    pub language: String,

    /// Page segmentation mode (`--psm`).
    pub psm: u8,

    /// The `tesseract` executable to run.
    pub binary: PathBuf,
}

impl Default for TesseractSettings {
    fn default() -> Self {
        Self {
            common: CommonEngineSettings::default(),
            language: "eng".to_owned(),
            psm: 3,
            binary: PathBuf::from("tesseract"),
        }
    }
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractAdapter {
    name: String,
    capability: EngineCapability,
    language: String,
    psm: u8,
    binary: PathBuf,
}

impl TesseractAdapter {
    /// Create a new `tesseract` engine.
    pub fn new(settings: &TesseractSettings) -> Self {
        Self {
            name: settings.common.name_or("tesseract"),
            capability: EngineCapability::from_settings(
                &settings.common,
                1.0,
                DEFAULT_FITNESS,
                true,
            ),
            language: settings.language.clone(),
            psm: settings.psm,
            binary: settings.binary.clone(),
        }
    }
}

#[async_trait]
impl EngineAdapter for TesseractAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Printed
    }

    fn capability(&self) -> &EngineCapability {
        &self.capability
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.name, page = page.index))]
    async fn recognize(&self, page: Arc<Page>, _deadline: Instant) -> Result<Vec<TextBlock>> {
        // Write our page to a temporary file. The directory is removed when
        // we return, or when we're cancelled.
        let png = spawn_blocking_propagating_panics(move || page.to_png()).await?;
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract, with TSV output on stdout. If we're cancelled, the
        // process is killed.
        let output = Command::new(&self.binary)
            .arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .arg("--psm")
            .arg(self.psm.to_string())
            .arg("tsv")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("cannot run {:?}", self.binary))?;
        check_for_command_failure("tesseract", &output, Some(&TESSERACT_ERROR_REGEX))?;

        let tsv = String::from_utf8(output.stdout).context("tesseract output is not UTF-8")?;
        let blocks = parse_tsv(&tsv)?;
        debug!(blocks = blocks.len(), "Parsed tesseract output");
        Ok(blocks)
    }
}

/// A paragraph we're assembling from TSV word rows.
struct Paragraph {
    key: (u32, u32),
    lines: Vec<(u32, Vec<String>)>,
    regions: Vec<BoundingBox>,
    confidences: Vec<f32>,
}

/// Parse `tesseract ... tsv` output into one block per paragraph.
fn parse_tsv(tsv: &str) -> Result<Vec<TextBlock>> {
    let mut paragraphs: Vec<Paragraph> = vec![];
    for (line_number, row) in tsv.lines().enumerate().skip(1) {
        if row.trim().is_empty() {
            continue;
        }
        let fields = row.split('\t').collect::<Vec<_>>();
        if fields.len() < 12 {
            return Err(anyhow!(
                "tesseract TSV line {} has {} fields",
                line_number + 1,
                fields.len()
            ));
        }
        // Only level 5 rows are words.
        if fields[0] != "5" {
            continue;
        }
        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }
        let number = |i: usize| -> Result<f32> {
            fields[i].trim().parse::<f32>().with_context(|| {
                format!(
                    "bad number {:?} on tesseract TSV line {}",
                    fields[i],
                    line_number + 1
                )
            })
        };
        let key = (number(2)? as u32, number(3)? as u32);
        let line = number(4)? as u32;
        let (left, top, width, height) = (number(6)?, number(7)?, number(8)?, number(9)?);
        let confidence = number(10)?;

        if paragraphs.last().is_none_or(|p| p.key != key) {
            paragraphs.push(Paragraph {
                key,
                lines: vec![],
                regions: vec![],
                confidences: vec![],
            });
        }
        let Some(paragraph) = paragraphs.last_mut() else {
            continue;
        };
        match paragraph.lines.last_mut() {
            Some((n, words)) if *n == line => words.push(text.to_owned()),
            _ => paragraph.lines.push((line, vec![text.to_owned()])),
        }
        paragraph
            .regions
            .push(BoundingBox::new(left, top, left + width, top + height));
        // Tesseract reports -1 when it has no confidence.
        if confidence >= 0.0 {
            paragraph.confidences.push((confidence / 100.0).clamp(0.0, 1.0));
        }
    }

    Ok(paragraphs
        .into_iter()
        .filter_map(|paragraph| {
            let region = BoundingBox::covering(paragraph.regions)?;
            let confidence = (!paragraph.confidences.is_empty()).then(|| {
                paragraph.confidences.iter().sum::<f32>() / paragraph.confidences.len() as f32
            });
            let text = paragraph
                .lines
                .into_iter()
                .map(|(_, words)| words.join(" "))
                .collect::<Vec<_>>()
                .join("\n");
            Some(TextBlock {
                text,
                region,
                confidence,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::{DynamicImage, GrayImage};

    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t800\t600\t-1\t
2\t1\t1\t0\t0\t0\t50\t40\t300\t60\t-1\t
3\t1\t1\t1\t0\t0\t50\t40\t300\t60\t-1\t
4\t1\t1\t1\t1\t0\t50\t40\t300\t20\t-1\t
5\t1\t1\t1\t1\t1\t50\t40\t100\t20\t96.0\tDear
5\t1\t1\t1\t1\t2\t160\t40\t80\t20\t90.0\tSir,
5\t1\t1\t1\t2\t1\t50\t80\t300\t20\t84.0\tthanks
5\t1\t2\t1\t1\t1\t50\t300\t120\t20\t-1\tP.S.
5\t1\t2\t1\t1\t2\t200\t300\t50\t20\t70.0\t
";

    #[test]
    fn test_parse_tsv() {
        let blocks = parse_tsv(TSV).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].text, "Dear Sir,\nthanks");
        assert_eq!(blocks[0].region, BoundingBox::new(50.0, 40.0, 350.0, 100.0));
        assert!((blocks[0].confidence.unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(blocks[1].text, "P.S.");
        assert_eq!(blocks[1].confidence, None);
    }

    #[test]
    fn test_parse_tsv_rejects_garbage() {
        assert!(parse_tsv("header\n5\t1\t2\n").is_err());
        assert!(parse_tsv("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let adapter = TesseractAdapter::new(&TesseractSettings {
            binary: PathBuf::from("/nonexistent/tesseract"),
            ..Default::default()
        });
        let page = Page::new(0, Some(DynamicImage::ImageLuma8(GrayImage::new(4, 4))), None);
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = adapter
            .recognize(Arc::new(page), deadline)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot run"), "{err:#}");
    }

    #[test]
    fn test_requires_an_image() {
        let adapter = TesseractAdapter::new(&Default::default());
        assert!(adapter.capability().requires_image);
        assert_eq!(adapter.name(), "tesseract");
    }
}

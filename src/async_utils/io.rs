//! I/O utilities.
//!
//! This module is responsible for reading JSON and TOML configuration files,
//! reading JSONL input records, and writing JSONL output records.
//!
//! Input and output use async streams from Tokio, so that we can keep a
//! limited number of documents in flight at once without buffering the whole
//! input.

use std::sync::Arc;

use futures::{TryStreamExt as _, pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter},
};
use tokio_stream::wrappers::LinesStream;

use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::BoxedStream;

/// Read TOML or JSON from a file. We decide based on the file extension,
/// falling back to sniffing for a leading `{`.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    let is_json = ext == "json" || (ext != "toml" && data.trim_start().starts_with('{'));
    if is_json {
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("Failed to parse TOML from file at path: {:?}", path))
    }
}

/// Open a file or standard input for line-based reading.
async fn open_reader(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncRead + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .await
                .with_context(|| format!("Failed to open file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdin())),
    }
}

/// Count the non-blank lines in a JSONL file, so we can show a progress bar.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn count_jsonl_records(ui: &Ui, path: &Path) -> Result<(usize, Option<usize>)> {
    // If this isn't a file, we can't count records. This may happen if our
    // input is a named pipe.
    if !path.is_file() {
        return Ok((0, None));
    }

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🧮",
        msg: "Counting input records",
        done_msg: "Counted input records",
    });
    let reader = BufReader::new(open_reader(Some(path)).await?);
    let count = LinesStream::new(reader.lines())
        .try_fold(0, |acc, line| async move {
            Ok(if line.trim().is_empty() { acc } else { acc + 1 })
        })
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    spinner.finish_with_message(format!("Found {count} records"));
    Ok((count, Some(count)))
}

/// A stream of [`serde_json::Value`] values.
pub type JsonStream = BoxedStream<Result<Value>>;

/// Read JSONL from a file or stdin. Blank lines are skipped.
///
/// Returns the stream, and a size hint for progress bars.
pub async fn read_jsonl(
    ui: &Ui,
    path: Option<&Path>,
) -> Result<(JsonStream, (usize, Option<usize>))> {
    let size_hint = match path {
        Some(path) => count_jsonl_records(ui, path).await?,
        None => (0, None),
    };
    let description = Arc::new(match path {
        Some(path) => path.display().to_string(),
        None => "stdin".to_owned(),
    });

    let reader = BufReader::new(open_reader(path).await?);
    let lines = LinesStream::new(reader.lines())
        .try_filter(|line| futures::future::ready(!line.trim().is_empty()));
    let stream = lines.map(move |line| {
        let line = line.with_context(|| format!("Failed to read from {}", description))?;
        serde_json::from_str::<Value>(&line).with_context(|| {
            format!("Failed to parse JSON from line in {}: {:?}", description, line)
        })
    });
    Ok((Box::pin(stream), size_hint))
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of JSON values to either standard output or a file, one per
/// line.
pub async fn write_output(path: Option<&Path>, stream: JsonStream) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(value) = stream.next().await {
        let value = value?;
        let json = serde_json::to_string(&value)
            .with_context(|| format!("Failed to serialize JSON: {:?}", value))?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

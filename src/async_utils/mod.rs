//! Asynchronous utilities for use with Tokio.
//!
//! The rest of the crate can mostly ignore how these work. They exist so that
//! CPU-heavy page analysis and external OCR processes don't stall the async
//! executor.

use std::{pin::Pin, sync::LazyLock};

use futures::Stream;
use regex::Regex;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// Matches `tesseract` warnings that mean the page could not be read at all.
pub static TESSERACT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(error|read_params_file|Image too (small|large))")
        .expect("failed to compile regex")
});

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked against a
/// regex to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(regex) = error_regex
            && regex.is_match(&stderr)
        {
            return Err(anyhow!("{} printed error output:\n{}", command_name, stderr));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[tokio::test]
    async fn test_spawn_blocking_returns_value() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }

    #[test]
    fn test_check_for_command_failure() {
        let ok = Command::new("sh").args(["-c", "true"]).output().unwrap();
        assert!(check_for_command_failure("sh", &ok, None).is_ok());

        let failed = Command::new("sh").args(["-c", "exit 3"]).output().unwrap();
        let err = check_for_command_failure("sh", &failed, None).unwrap_err();
        assert!(err.to_string().contains("exit code 3"));

        let noisy = Command::new("sh")
            .args(["-c", "echo 'Error, cannot read input file' >&2"])
            .output()
            .unwrap();
        assert!(
            check_for_command_failure("sh", &noisy, Some(&TESSERACT_ERROR_REGEX))
                .is_err()
        );
    }
}

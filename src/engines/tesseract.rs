//! Tesseract OCR engine.

use std::{process::Command, sync::LazyLock};

use regex::Regex;

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::OcrEngine;

/// Leptonica reports unreadable images this way, sometimes without failing.
static TESSERACT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Error in ").expect("failed to compile regex"));

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug)]
pub struct TesseractEngine {
    /// The command to run.
    command: PathBuf,

    /// The language(s) to pass with `-l`, if any.
    language: Option<String>,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new(command: PathBuf, language: Option<String>) -> Self {
        Self { command, language }
    }

    /// Build the command line for OCRing `path`, printing text to stdout.
    fn extract_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg(path).arg("stdout");
        if let Some(language) = &self.language {
            cmd.arg("-l").arg(language);
        }
        cmd
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "Tesseract OCR"
    }

    fn probe(&mut self) -> Result<()> {
        let output = Command::new(&self.command)
            .arg("--version")
            .output()
            .with_context(|| format!("cannot run {:?}", self.command))?;
        check_for_command_failure("tesseract", &output, None)?;

        // Older versions print their version to stderr.
        let version = [&output.stdout, &output.stderr]
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .find_map(|text| text.lines().next().map(str::to_owned))
            .unwrap_or_default();
        info!(command = %self.command.display(), %version, "Found tesseract");
        Ok(())
    }

    fn extract_text(&mut self, path: &Path) -> Result<String> {
        let output = self
            .extract_command(path)
            .output()
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, Some(&TESSERACT_ERROR_REGEX))?;
        String::from_utf8(output.stdout).context("tesseract output was not valid UTF-8")
    }
}

//! Page text recognition.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::trace;

use crate::config::OcrConfig;
use crate::error::OcrError;
use crate::render::RenderedPage;

/// Image in, text out.
///
/// Low-quality input yields empty or garbled text rather than an error.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, page: &RenderedPage) -> Result<String, OcrError>;
}

/// Tesseract driven through its command-line interface.
///
/// The page JPEG is piped to `tesseract stdin stdout` and the recognised text
/// is read back from stdout.
pub struct TesseractCli {
    command: PathBuf,
    language: Option<String>,
}

impl TesseractCli {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.tesseract_cmd.clone(),
            language: config.language.clone(),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg("stdin").arg("stdout");
        if let Some(lang) = &self.language {
            cmd.arg("-l").arg(lang);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl OcrEngine for TesseractCli {
    fn recognize(&self, page: &RenderedPage) -> Result<String, OcrError> {
        let mut child = self.build_command().spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                OcrError::Unavailable {
                    command: self.command.clone(),
                    source,
                }
            } else {
                OcrError::Io(source)
            }
        })?;

        // Feed stdin from a separate thread so a full stdout pipe cannot
        // deadlock the write.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Io(std::io::Error::other("tesseract stdin not captured")))?;
        let (output, written) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(&page.jpeg));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("tesseract stdin writer panicked")));
            (output, written)
        });
        let output = output.map_err(OcrError::Io)?;

        if !output.status.success() {
            return Err(OcrError::Engine {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match written {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(OcrError::Io(e)),
            _ => {}
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!(
            page = page.number,
            width = page.width,
            height = page.height,
            chars = text.len(),
            "Recognised page text"
        );

        Ok(text)
    }
}

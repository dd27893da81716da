// src/gcode/file_source.rs - Line-by-line reader for stored command files
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

use crate::gcode::line_buffer::LineBuffer;
use crate::gcode::message::LineFormat;

#[derive(Debug, Error)]
pub enum FileSourceError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Supplies the playback branch with one line per call.
pub trait LineSource: Send {
    /// Replace the contents of `line` with the next line. Returns `false` at
    /// end of stream or on a read error.
    fn read_next_line(&mut self, line: &mut LineBuffer) -> bool;

    /// Framing of the lines this source produces.
    fn format(&self) -> LineFormat {
        LineFormat::Text
    }
}

/// Line source over a file loaded into memory. Line terminators (`\n` or
/// `\r\n`) are stripped; lines longer than the buffer are truncated.
#[derive(Debug, Clone)]
pub struct FileLineSource {
    name: String,
    content: Vec<u8>,
    pos: usize,
}

impl FileLineSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FileSourceError> {
        let path = path.as_ref();
        let content = fs::read(path).await.map_err(|source| FileSourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded {} ({} bytes) for playback", path.display(), content.len());
        Ok(Self::from_bytes(path.display().to_string(), content))
    }

    pub fn from_bytes(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            pos: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LineSource for FileLineSource {
    fn read_next_line(&mut self, line: &mut LineBuffer) -> bool {
        if self.pos >= self.content.len() {
            return false;
        }
        let rest = &self.content[self.pos..];
        let (mut text, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        if text.last() == Some(&b'\r') {
            text = &text[..text.len() - 1];
        }
        self.pos += consumed;

        line.clear();
        line.extend_from_slice(text);
        true
    }
}

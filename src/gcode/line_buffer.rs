// src/gcode/line_buffer.rs - Fixed-capacity line storage shared by every input source

/// Capacity of every line buffer, in bytes.
pub const MAX_LINE: usize = 192;

/// Fixed-capacity byte buffer holding one pending command, either a raw text
/// line or a packed command stream.
///
/// Writes past the capacity are dropped without any signal. Producers are
/// expected to size their commands to fit; the length can never exceed
/// [`MAX_LINE`].
#[derive(Clone)]
pub struct LineBuffer {
    data: [u8; MAX_LINE],
    len: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_LINE],
            len: 0,
        }
    }

    /// Build a buffer from `bytes`, truncating at capacity.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.extend_from_slice(bytes);
        buf
    }

    pub fn capacity(&self) -> usize {
        MAX_LINE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= MAX_LINE
    }

    pub fn remaining(&self) -> usize {
        MAX_LINE - self.len
    }

    /// Append one byte. A full buffer ignores the write.
    pub fn push_byte(&mut self, byte: u8) {
        if self.len < MAX_LINE {
            self.data[self.len] = byte;
            self.len += 1;
        }
    }

    /// Append as many bytes of `bytes` as fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let take = bytes.len().min(self.remaining());
        self.data[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
    }

    /// Forget the contents so the buffer can be refilled.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LineBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for LineBuffer {}

impl std::fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineBuffer")
            .field("len", &self.len)
            .field("data", &String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

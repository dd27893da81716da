//! # Packed command encoding
//!
//! Producers that already know the fields of a command can hand the
//! interpreter a binary-framed line instead of text. A packed line is a
//! sequence of `(tag, payload)` pairs:
//!
//! ```text
//!  7      3 2     0
//! +--------+-------+----------------------+
//! | field  | type  | payload (0..4 bytes, |
//! | A=1..Z |       | or NUL-terminated)   |
//! +--------+-------+----------------------+
//! ```
//!
//! Integers are written in the narrowest width that holds them and every
//! multi-byte payload is little-endian. A field that is not a letter (the `*`
//! checksum marker) is written with the [`CODE_STAR`] tag.
//!
//! The `append_*` functions never fail: a full buffer truncates the field and
//! a bad letter is either replaced by [`CODE_STAR`] (integers) or dropped
//! (floats and strings). The `try_append_*` functions check everything first
//! and leave the buffer untouched on error.

use thiserror::Error;

use crate::gcode::line_buffer::LineBuffer;

/// Tag written in place of a field-coded tag when the field is not a letter.
pub const CODE_STAR: u8 = 0xF8;

const FIELD_SHIFT: u8 = 3;
const SELECTOR_MASK: u8 = 0x07;
const LAST_FIELD_CODE: u8 = 26;

/// Payload shape carried in the low three bits of a tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    None = 0,
    Int8 = 1,
    Uint8 = 2,
    Uint16 = 3,
    Int16 = 4,
    Int32 = 5,
    Float = 6,
    String = 7,
}

impl ArgType {
    pub fn from_selector(bits: u8) -> Self {
        match bits & SELECTOR_MASK {
            0 => ArgType::None,
            1 => ArgType::Int8,
            2 => ArgType::Uint8,
            3 => ArgType::Uint16,
            4 => ArgType::Int16,
            5 => ArgType::Int32,
            6 => ArgType::Float,
            _ => ArgType::String,
        }
    }

    /// Fixed payload width in bytes; `None` for NUL-terminated strings.
    pub fn payload_width(self) -> Option<usize> {
        match self {
            ArgType::None => Some(0),
            ArgType::Int8 | ArgType::Uint8 => Some(1),
            ArgType::Uint16 | ArgType::Int16 => Some(2),
            ArgType::Int32 | ArgType::Float => Some(4),
            ArgType::String => None,
        }
    }

    /// Narrowest integer type that holds `value`.
    pub fn for_int(value: i32) -> Self {
        if value < 0 {
            if value < i16::MIN as i32 {
                ArgType::Int32
            } else if value < i8::MIN as i32 {
                ArgType::Int16
            } else {
                ArgType::Int8
            }
        } else if value > u16::MAX as i32 {
            ArgType::Int32
        } else if value > u8::MAX as i32 {
            ArgType::Uint16
        } else {
            ArgType::Uint8
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("'{0}' is not a field letter")]
    InvalidLetter(char),
    #[error("field needs {needed} bytes but only {remaining} remain")]
    Overflow { needed: usize, remaining: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("tag 0x{tag:02x} at offset {offset} has no field code")]
    BadFieldCode { offset: usize, tag: u8 },
    #[error("payload at offset {offset} needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("string at offset {offset} has no terminator")]
    UnterminatedString { offset: usize },
}

/// Field code for `letter` (A=1 .. Z=26), case-insensitive.
pub fn field_code(letter: char) -> Option<u8> {
    let upper = letter.to_ascii_uppercase();
    if upper.is_ascii_uppercase() {
        Some(upper as u8 - b'@')
    } else {
        None
    }
}

/// Build the tag byte for `letter` carrying `arg_type`.
pub fn coded_tag(letter: char, arg_type: ArgType) -> Option<u8> {
    field_code(letter).map(|code| (code << FIELD_SHIFT) | arg_type as u8)
}

/// Append a raw tag byte with no payload.
pub fn append_opcode(buf: &mut LineBuffer, code: u8) {
    buf.push_byte(code);
}

/// Append an integer field in its narrowest width. A non-letter field is
/// written with [`CODE_STAR`] and the same payload.
pub fn append_int(buf: &mut LineBuffer, letter: char, value: i32) {
    let arg_type = ArgType::for_int(value);
    let tag = coded_tag(letter, arg_type).unwrap_or(CODE_STAR);
    buf.push_byte(tag);
    push_payload(buf, &value.to_le_bytes(), arg_type);
}

/// Append a float field. A non-letter field writes nothing.
pub fn append_float(buf: &mut LineBuffer, letter: char, value: f32) {
    let Some(tag) = coded_tag(letter, ArgType::Float) else {
        return;
    };
    buf.push_byte(tag);
    for byte in value.to_bits().to_le_bytes() {
        buf.push_byte(byte);
    }
}

/// Append a string field followed by a zero terminator. A non-letter field
/// writes nothing.
pub fn append_string(buf: &mut LineBuffer, letter: char, text: &str) {
    let Some(tag) = coded_tag(letter, ArgType::String) else {
        return;
    };
    buf.push_byte(tag);
    for &byte in text.as_bytes() {
        buf.push_byte(byte);
    }
    buf.push_byte(0);
}

pub fn try_append_opcode(buf: &mut LineBuffer, code: u8) -> Result<(), PackError> {
    reserve(buf, 1)?;
    buf.push_byte(code);
    Ok(())
}

/// Checked [`append_int`]. Accepts `*` for the checksum sentinel and rejects
/// every other non-letter.
pub fn try_append_int(buf: &mut LineBuffer, letter: char, value: i32) -> Result<(), PackError> {
    let arg_type = ArgType::for_int(value);
    let tag = match coded_tag(letter, arg_type) {
        Some(tag) => tag,
        None if letter == '*' => CODE_STAR,
        None => return Err(PackError::InvalidLetter(letter)),
    };
    reserve(buf, 1 + arg_type.payload_width().unwrap_or(0))?;
    buf.push_byte(tag);
    push_payload(buf, &value.to_le_bytes(), arg_type);
    Ok(())
}

pub fn try_append_float(buf: &mut LineBuffer, letter: char, value: f32) -> Result<(), PackError> {
    if coded_tag(letter, ArgType::Float).is_none() {
        return Err(PackError::InvalidLetter(letter));
    }
    reserve(buf, 5)?;
    append_float(buf, letter, value);
    Ok(())
}

pub fn try_append_string(buf: &mut LineBuffer, letter: char, text: &str) -> Result<(), PackError> {
    if coded_tag(letter, ArgType::String).is_none() {
        return Err(PackError::InvalidLetter(letter));
    }
    reserve(buf, text.len() + 2)?;
    append_string(buf, letter, text);
    Ok(())
}

fn reserve(buf: &LineBuffer, needed: usize) -> Result<(), PackError> {
    let remaining = buf.remaining();
    if needed > remaining {
        return Err(PackError::Overflow { needed, remaining });
    }
    Ok(())
}

fn push_payload(buf: &mut LineBuffer, le_bytes: &[u8; 4], arg_type: ArgType) {
    let width = arg_type.payload_width().unwrap_or(0);
    for &byte in &le_bytes[..width] {
        buf.push_byte(byte);
    }
}

/// Decoded payload of one packed field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackedValue<'a> {
    None,
    Int(i32),
    Float(f32),
    Str(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackedField<'a> {
    Word { letter: char, value: PackedValue<'a> },
    /// The sentinel tag carries no width, so it owns the rest of the line.
    Star(&'a [u8]),
}

/// Iterator over the fields of a packed line. Stops after the first error.
#[derive(Debug, Clone)]
pub struct PackedReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> PackedReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, error: DecodeError) -> Option<Result<PackedField<'a>, DecodeError>> {
        self.failed = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for PackedReader<'a> {
    type Item = Result<PackedField<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.bytes.len() {
            return None;
        }
        let offset = self.pos;
        let tag = self.bytes[offset];
        self.pos += 1;
        let rest = &self.bytes[self.pos..];

        if tag == CODE_STAR {
            self.pos = self.bytes.len();
            return Some(Ok(PackedField::Star(rest)));
        }

        let code = tag >> FIELD_SHIFT;
        if code == 0 || code > LAST_FIELD_CODE {
            return self.fail(DecodeError::BadFieldCode { offset, tag });
        }
        let letter = (b'@' + code) as char;
        let arg_type = ArgType::from_selector(tag);

        let value = match arg_type.payload_width() {
            None => {
                let Some(end) = rest.iter().position(|&b| b == 0) else {
                    return self.fail(DecodeError::UnterminatedString { offset });
                };
                self.pos += end + 1;
                PackedValue::Str(&rest[..end])
            }
            Some(width) if rest.len() < width => {
                return self.fail(DecodeError::Truncated {
                    offset,
                    needed: width,
                    available: rest.len(),
                });
            }
            Some(width) => {
                self.pos += width;
                let p = &rest[..width];
                match arg_type {
                    ArgType::Int8 => PackedValue::Int(p[0] as i8 as i32),
                    ArgType::Uint8 => PackedValue::Int(p[0] as i32),
                    ArgType::Uint16 => PackedValue::Int(u16::from_le_bytes([p[0], p[1]]) as i32),
                    ArgType::Int16 => PackedValue::Int(i16::from_le_bytes([p[0], p[1]]) as i32),
                    ArgType::Int32 => PackedValue::Int(i32::from_le_bytes([p[0], p[1], p[2], p[3]])),
                    ArgType::Float => {
                        PackedValue::Float(f32::from_bits(u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
                    }
                    ArgType::None | ArgType::String => PackedValue::None,
                }
            }
        };
        Some(Ok(PackedField::Word { letter, value }))
    }
}

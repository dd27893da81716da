// src/interpreter.rs - Minimal line interpreter and motion backend for host runs
use crate::gcode::{InputMessage, LineFormat, PackedField, PackedReader, ParseResult};
use crate::gcode_task::{LineInterpreter, MotionBackend};

/// Checks the shape of each line and answers `ok` or an error on the
/// message's sink. Text lines must be letter-number words with optional `;`
/// comments and an optional `*checksum`; packed lines must decode cleanly.
#[derive(Debug, Default)]
pub struct ReplyInterpreter {
    lines: u64,
    errors: u64,
}

impl ReplyInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    fn check_text(line: &[u8]) -> Result<bool, (ParseResult, String)> {
        let line = match line.iter().position(|&b| b == b';') {
            Some(comment) => &line[..comment],
            None => line,
        };
        let body = match line.iter().rposition(|&b| b == b'*') {
            Some(star) => {
                let expected = line[..star].iter().fold(0u8, |acc, &b| acc ^ b);
                let given = std::str::from_utf8(&line[star + 1..])
                    .ok()
                    .and_then(|s| s.trim().parse::<u8>().ok());
                if given != Some(expected) {
                    return Err((ParseResult::ChecksumMismatch, "checksum mismatch".to_string()));
                }
                &line[..star]
            }
            None => line,
        };

        let text = String::from_utf8_lossy(body);
        let mut words = text.split_whitespace().peekable();
        let Some(first) = words.peek() else {
            return Ok(false);
        };
        if !matches!(first.as_bytes()[0].to_ascii_uppercase(), b'G' | b'M' | b'T' | b'N') {
            return Err((ParseResult::UnknownCommand, format!("unknown command '{}'", first)));
        }
        for word in words {
            let mut chars = word.chars();
            let letter_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
            let number = chars.as_str();
            if !letter_ok || (!number.is_empty() && number.parse::<f32>().is_err()) {
                return Err((ParseResult::Error, format!("bad word '{}'", word)));
            }
        }
        Ok(true)
    }

    fn check_packed(line: &[u8]) -> Result<bool, (ParseResult, String)> {
        let mut fields = 0;
        for field in PackedReader::new(line) {
            match field {
                Ok(PackedField::Word { letter, value }) => {
                    tracing::trace!("Packed field {} = {:?}", letter, value);
                    fields += 1;
                }
                Ok(PackedField::Star(_)) => {}
                Err(e) => return Err((ParseResult::Error, e.to_string())),
            }
        }
        Ok(fields > 0)
    }
}

impl LineInterpreter for ReplyInterpreter {
    fn init(&mut self) {
        self.lines = 0;
        self.errors = 0;
        tracing::debug!("Reply interpreter initialised");
    }

    fn interpret(&mut self, message: &InputMessage) -> ParseResult {
        let line = message.line().as_bytes();
        let checked = match message.format() {
            LineFormat::Text => Self::check_text(line),
            LineFormat::Packed => Self::check_packed(line),
        };
        match checked {
            // Blank lines and comments get no reply.
            Ok(false) => ParseResult::Ok,
            Ok(true) => {
                self.lines += 1;
                message.reply("ok\r\n");
                ParseResult::Ok
            }
            Err((result, reason)) => {
                self.errors += 1;
                tracing::warn!("Rejected line: {}", reason);
                message.reply(&format!("Error: {}\r\n", reason));
                result
            }
        }
    }
}

/// Motion backend with no hardware behind it.
#[derive(Debug, Default)]
pub struct NullMotion;

impl MotionBackend for NullMotion {
    fn plan_init(&mut self) {
        tracing::info!("Planner initialised (no motion hardware)");
    }

    fn stepper_init(&mut self) {
        tracing::info!("Stepper initialised (no motion hardware)");
    }
}

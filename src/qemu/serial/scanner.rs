//! Line scanner for QEMU's serial output, and the directives guests embed in it.
//!
//! The guest asks the host for things by printing a line with a known
//! prefix. Everything else on the console is just log output.

use super::ansi::strip_ansi_codes;
use std::borrow::Cow;
use std::io::{self, BufRead};

/// Guest asks for a screenshot to be compared against a named reference.
pub const SCREENSHOT_PREFIX: &str = "SCREENSHOT: ";

/// An instruction parsed from one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Capture the screen and compare it with the reference of this name.
    Screenshot(String),
}

impl Directive {
    /// Recognize a directive in an already-cleaned line.
    pub fn parse(line: &str) -> Option<Self> {
        line.strip_prefix(SCREENSHOT_PREFIX)
            .map(|name| Directive::Screenshot(name.to_string()))
    }
}

/// Cleaned, non-empty lines from a console stream, until it closes.
pub struct OutputScanner<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> OutputScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for OutputScanner<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = clean_line(&decode(&self.buf));
                    if !line.is_empty() {
                        return Some(Ok(line));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Trim whitespace and strip escape sequences.
pub fn clean_line(raw: &str) -> String {
    strip_ansi_codes(raw.trim()).trim().to_string()
}

/// Serial output is mostly UTF-8. Anything else is read as Latin-1 so a raw
/// 8-bit CSI byte still decodes to U+009B and gets stripped.
fn decode(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

//! ANSI escape code handling for serial console output.
//!
//! OVMF and the guest color their console output. Control sequences are
//! stripped so log lines stay readable and directives match by prefix.

/// 8-bit Control Sequence Introducer.
const CSI_8BIT: char = '\u{9b}';

/// Strip CSI escape sequences from a string.
///
/// A sequence is an introducer (`ESC [` or the 8-bit CSI `0x9B`), any
/// parameter bytes (`0x30..=0x3F`), any intermediate bytes (`0x20..=0x2F`)
/// and one final byte (`0x40..=0x7E`). An introducer that isn't followed by
/// a complete sequence is kept as-is.
pub fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(c) = rest.chars().next() {
        match sequence_len(rest) {
            Some(len) => rest = &rest[len..],
            None => {
                result.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
    result
}

/// Byte length of the escape sequence at the start of `s`, if there is one.
fn sequence_len(s: &str) -> Option<usize> {
    let body = if let Some(body) = s.strip_prefix("\x1b[") {
        body
    } else {
        s.strip_prefix(CSI_8BIT)?
    };
    let introducer = s.len() - body.len();

    // Every byte we accept is ASCII, so byte offsets are char boundaries
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() && (0x30..=0x3f).contains(&bytes[i]) {
        i += 1;
    }
    while i < bytes.len() && (0x20..=0x2f).contains(&bytes[i]) {
        i += 1;
    }
    if i < bytes.len() && (0x40..=0x7e).contains(&bytes[i]) {
        Some(introducer + i + 1)
    } else {
        None
    }
}

//! Content transfer encoding for attachments.
//!
//! Standard base64 (RFC 4648 alphabet, `=` padding) wrapped at 76 symbols per
//! line as required for MIME bodies (RFC 2045 §6.8). Lines are joined with
//! CRLF; there is no trailing line break.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Maximum encoded symbols per line.
pub const LINE_LENGTH: usize = 76;

/// Input bytes consumed per full line (`LINE_LENGTH / 4 * 3`).
const BYTES_PER_LINE: usize = 57;

/// Line separator between encoded lines.
pub const LINE_BREAK: &str = "\r\n";

/// Encode arbitrary bytes as line-wrapped base64.
///
/// Each 57-byte input chunk encodes to exactly one 76-symbol line, so only the
/// final line can be shorter or carry padding.
pub fn encode_wrapped(data: &[u8]) -> String {
    let lines: Vec<String> = data
        .chunks(BYTES_PER_LINE)
        .map(|chunk| STANDARD.encode(chunk))
        .collect();
    lines.join(LINE_BREAK)
}

/// Decode line-wrapped base64 produced by [`encode_wrapped`].
///
/// Whitespace between symbols is ignored.
///
/// # Errors
///
/// Returns an error if the input contains non-alphabet symbols or bad padding.
pub fn decode_wrapped(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact)
}

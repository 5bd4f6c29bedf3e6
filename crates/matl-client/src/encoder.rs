//! Conversion of pasted data into MATL literal syntax.
//!
//! Two paste formats are supported:
//!
//! - nested arrays as printed by Python or JSON (`[[1, 2], [3, 4]]`), which
//!   become a MATL 2-D array (`[1, 2; 3, 4]`)
//! - multi-line text, which becomes an array of quoted strings
//!   (`['ab';'cde']`)
//!
//! Every transform fails closed: invalid input produces an error and no text.

use std::sync::OnceLock;

use regex::Regex;

/// Maximum bracket nesting accepted by [`encode_nested_array`].
pub const MAX_ARRAY_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Array too deep (maximum nesting is {max})")]
    TooDeep { max: usize },

    #[error("Array is mal-formed")]
    Malformed,

    #[error("Nothing to paste")]
    Empty,
}

/// Paste formats offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasteFormat {
    Array,
    String,
}

/// Options for the multi-line string transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringEncoding {
    /// Pad every line with trailing spaces to the longest line, and emit a
    /// single line without brackets.
    pub pad: bool,
}

/// Guess the format of pasted text: anything without cased letters is
/// treated as an array.
pub fn detect_format(input: &str) -> PasteFormat {
    if input.to_lowercase() == input.to_uppercase() {
        PasteFormat::Array
    } else {
        PasteFormat::String
    }
}

/// Encode `input` in the given format.
pub fn encode(
    input: &str,
    format: PasteFormat,
    strings: StringEncoding,
) -> Result<String, EncodeError> {
    match format {
        PasteFormat::Array => encode_nested_array(input),
        PasteFormat::String => encode_multiline_string(input, strings),
    }
}

/// Check bracket balance and depth.
fn verify_array(value: &str, max_depth: usize) -> Result<(), EncodeError> {
    let mut depth: usize = 0;

    for character in value.chars() {
        match character {
            '[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(EncodeError::TooDeep { max: max_depth });
                }
            }
            ']' => {
                depth = depth.checked_sub(1).ok_or(EncodeError::Malformed)?;
            }
            _ => {}
        }
    }

    if depth == 0 {
        Ok(())
    } else {
        Err(EncodeError::Malformed)
    }
}

struct ArrayPatterns {
    row_boundary: Regex,
    open_pair: Regex,
    close_pair: Regex,
    whitespace: Regex,
    comma: Regex,
}

fn array_patterns() -> &'static ArrayPatterns {
    static PATTERNS: OnceLock<ArrayPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ArrayPatterns {
        row_boundary: Regex::new(r"\]\s*,?\s*\[").expect("valid regex"),
        open_pair: Regex::new(r"\[\s*\[\s*").expect("valid regex"),
        close_pair: Regex::new(r"\]\s*\]\s*").expect("valid regex"),
        whitespace: Regex::new(r"\s+").expect("valid regex"),
        comma: Regex::new(r"\s*,\s*").expect("valid regex"),
    })
}

/// Convert nested arrays (depth ≤ 2) into a MATL 2-D array literal.
pub fn encode_nested_array(input: &str) -> Result<String, EncodeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(EncodeError::Empty);
    }
    verify_array(trimmed, MAX_ARRAY_DEPTH)?;

    let patterns = array_patterns();
    let out = patterns.row_boundary.replace_all(trimmed, "; ");
    let out = patterns.open_pair.replace_all(&out, "[");
    let out = patterns.close_pair.replace_all(&out, "]");
    let out = patterns.whitespace.replace_all(&out, " ");
    let out = patterns.comma.replace_all(&out, ", ");

    Ok(out.trim().to_string())
}

/// Convert multi-line text into a MATL array of quoted strings.
pub fn encode_multiline_string(
    input: &str,
    options: StringEncoding,
) -> Result<String, EncodeError> {
    if input.is_empty() {
        return Err(EncodeError::Empty);
    }

    let lines: Vec<&str> = input
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();

    let width = if options.pad {
        lines.iter().map(|line| line.chars().count()).max().unwrap_or(0)
    } else {
        0
    };

    let quoted: Vec<String> = lines
        .iter()
        .map(|line| {
            let padding = width.saturating_sub(line.chars().count());
            format!("'{}{}'", line.replace('\'', "''"), " ".repeat(padding))
        })
        .collect();

    if options.pad && quoted.len() == 1 {
        return Ok(quoted.join(""));
    }

    Ok(format!("[{}]", quoted.join(";")))
}

/// Append an encoded value to the inputs field, one input per line.
pub fn append_input(existing: &str, encoded: &str) -> String {
    if existing.is_empty() {
        encoded.to_string()
    } else {
        format!("{}\n{}", existing, encoded)
    }
}

//! Wire decoder for the inbound webhook payload.
//!
//! The email gateway posts `multipart/form-data` whose parts are plain form
//! fields (no file payloads worth keeping). The decoder is deliberately
//! forgiving: bytes that are not valid UTF-8 are kept as replacement
//! characters, a missing or wrong boundary triggers one sniffing retry, and
//! a partially parsed payload is still returned to the caller.

use std::collections::HashMap;

use tracing::warn;

/// Boundary used by the gateway when none is advertised in the content type.
pub const DEFAULT_BOUNDARY: &str = "xYzZY";

/// How far into the payload the boundary sniffer looks.
const SNIFF_WINDOW: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("no recognizable multipart parts in payload")]
    Unrecognizable,
}

/// Decode a raw multipart payload into a field-name → value map.
///
/// The boundary comes from the `content_type` parameter when present,
/// otherwise [`DEFAULT_BOUNDARY`]. If the chosen boundary yields fewer than
/// two parts the first [`SNIFF_WINDOW`] bytes are scanned for a `--token`
/// marker and decoding is retried once with the sniffed boundary.
pub fn decode_form(
    raw: &[u8],
    content_type: Option<&str>,
) -> Result<HashMap<String, String>, WireError> {
    let text = String::from_utf8_lossy(raw);
    let boundary = content_type
        .and_then(boundary_param)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    let (mut fields, mut parts) = parse_with_boundary(&text, &boundary);
    if parts < 2 {
        if let Some(sniffed) = sniff_boundary(&text) {
            if sniffed != boundary {
                let (refields, reparts) = parse_with_boundary(&text, &sniffed);
                if reparts > parts {
                    warn!(
                        "multipart boundary '{}' yielded {} parts, retried with sniffed '{}'",
                        boundary, parts, sniffed
                    );
                    fields = refields;
                    parts = reparts;
                }
            }
        }
    }

    if parts == 0 && fields.is_empty() {
        return Err(WireError::Unrecognizable);
    }
    if parts < 2 {
        warn!("multipart payload decoded partially: {} part(s)", parts);
    }
    Ok(fields)
}

/// Extract the `boundary=` parameter from a content-type header value.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';') {
        let param = param.trim();
        if let Some(value) = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("BOUNDARY="))
        {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn parse_with_boundary(text: &str, boundary: &str) -> (HashMap<String, String>, usize) {
    let marker = format!("--{}", boundary);
    let mut fields = HashMap::new();
    let mut parts = 0usize;
    for segment in text.split(marker.as_str()).skip(1) {
        // The terminator after the last part is `--<boundary>--`.
        if segment.starts_with("--") {
            break;
        }
        parts += 1;
        if let Some((name, value)) = parse_part(segment) {
            fields.insert(name, value);
        }
    }
    (fields, parts)
}

/// Parse a single part. Parts without a `name=` parameter are dropped;
/// parts with an empty body are kept with an empty value.
fn parse_part(segment: &str) -> Option<(String, String)> {
    let segment = segment
        .strip_prefix("\r\n")
        .or_else(|| segment.strip_prefix('\n'))
        .unwrap_or(segment);

    let (head, body) = match segment.find("\r\n\r\n") {
        Some(idx) => (&segment[..idx], &segment[idx + 4..]),
        None => match segment.find("\n\n") {
            Some(idx) => (&segment[..idx], &segment[idx + 2..]),
            None => (segment, ""),
        },
    };

    let mut name = None;
    for line in head.lines() {
        if line.to_ascii_lowercase().starts_with("content-disposition") {
            name = field_name(line);
        }
    }
    let name = name?;

    let value = body
        .strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body);
    Some((name, value.to_string()))
}

fn field_name(disposition_line: &str) -> Option<String> {
    let start = disposition_line.find("name=\"")? + "name=\"".len();
    let rest = &disposition_line[start..];
    let end = rest.find('"')?;
    let name = &rest[..end];
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Look for `--` followed by a boundary token near the start of the payload.
fn sniff_boundary(text: &str) -> Option<String> {
    let mut end = SNIFF_WINDOW.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let window = &text[..end];
    let start = window.find("--")? + 2;
    let token: String = text[start..]
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '\'' | '.'))
        .collect();
    let token = token.trim_end_matches('-').to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

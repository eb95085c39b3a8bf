//! Header field helpers shared by the protocol adapters and the backend.
//!
//! Header lists are ordered `(name, value)` byte pairs. Request lists start
//! with the pseudo-headers `:method`, `:scheme`, `:path` and `:authority`;
//! response lists carry `:status`.

use bytes::Bytes;

use crate::error::{Error, Result};

/// One header field as raw bytes.
pub type HeaderField = (Bytes, Bytes);

/// Ordered header list.
pub type HeaderList = Vec<HeaderField>;

/// Whether `name` is a pseudo-header (`:status`, `:method`, ...).
pub fn is_pseudo(name: &[u8]) -> bool {
    name.first() == Some(&b':')
}

/// First value for `name` (exact match, names are expected lower-case).
pub fn find<'a>(headers: &'a [HeaderField], name: &[u8]) -> Option<&'a Bytes> {
    headers.iter().find(|(n, _)| n.as_ref() == name).map(|(_, v)| v)
}

/// Reorder so pseudo-headers come first, preserving relative order.
pub fn pseudo_first(headers: &[HeaderField]) -> HeaderList {
    let (mut pseudo, regular): (HeaderList, HeaderList) =
        headers.iter().cloned().partition(|(n, _)| is_pseudo(n));
    pseudo.extend(regular);
    pseudo
}

/// Lower-cased copy of a header name.
pub fn lowercase_name(name: &str) -> Bytes {
    Bytes::from(name.to_ascii_lowercase())
}

/// Validate a header name per RFC 9110 Section 5.1.
///
/// Header names must be tokens: 1*tchar where tchar excludes
/// delimiters, control characters, and whitespace.
pub fn validate_header_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::protocol("Empty header name"));
    }
    if !name.iter().all(|b| is_tchar(*b)) {
        return Err(Error::protocol(format!(
            "Invalid character in header name: {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// Validate a header value per RFC 9110 Section 5.5.
///
/// NUL, CR and LF are rejected to prevent header injection.
pub fn validate_header_value(value: &[u8]) -> Result<()> {
    if value.iter().any(|b| matches!(b, 0 | b'\r' | b'\n')) {
        return Err(Error::protocol(
            "Invalid character in header value (CR/LF/NUL not allowed)",
        ));
    }
    Ok(())
}

/// Check if a byte is a valid token character per RFC 9110.
fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Parse a Content-Length value per RFC 9112 Section 6.2.
///
/// Repeated values (`5, 5`) are accepted only when identical.
pub fn parse_content_length(value: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(value).ok()?;
    let mut parsed = None;
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let n = part.parse::<u64>().ok()?;
        match parsed {
            Some(prev) if prev != n => return None,
            _ => parsed = Some(n),
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(n: &'static str, v: &'static str) -> HeaderField {
        (Bytes::from_static(n.as_bytes()), Bytes::from_static(v.as_bytes()))
    }

    #[test]
    fn test_pseudo_first_is_stable() {
        let headers = vec![
            field(":method", "GET"),
            field("accept", "*/*"),
            field(":path", "/"),
            field("x-a", "1"),
            field(":authority", "example.com"),
        ];
        let sorted = pseudo_first(&headers);
        let names: Vec<&[u8]> = sorted.iter().map(|(n, _)| n.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                b":method".as_ref(),
                b":path",
                b":authority",
                b"accept",
                b"x-a"
            ]
        );
    }

    #[test]
    fn test_find() {
        let headers = vec![field(":status", "200"), field("content-length", "5")];
        assert_eq!(find(&headers, b"content-length").map(|v| v.as_ref()), Some(b"5".as_ref()));
        assert!(find(&headers, b"host").is_none());
    }

    // ========================================================================
    // RFC 9110/9112 validation
    // ========================================================================

    #[test]
    fn test_validate_header_name() {
        assert!(validate_header_name(b"content-type").is_ok());
        assert!(validate_header_name(b"X!#$%&'*+.^_`|~").is_ok());
        assert!(validate_header_name(b"").is_err());
        assert!(validate_header_name(b"Content Type").is_err());
        assert!(validate_header_name(b"Content:Type").is_err());
        assert!(validate_header_name(b"Content(Type)").is_err());
    }

    #[test]
    fn test_validate_header_value_rejects_injection() {
        assert!(validate_header_value(b"value\twith\ttabs").is_ok());
        assert!(validate_header_value(b"").is_ok());
        assert!(validate_header_value(b"value\r\nEvil: injected").is_err());
        assert!(validate_header_value(b"value\nmore").is_err());
        assert!(validate_header_value(b"value\x00more").is_err());
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length(b"0"), Some(0));
        assert_eq!(parse_content_length(b"12345678"), Some(12345678));
        assert_eq!(parse_content_length(b"100, 100"), Some(100));
        assert_eq!(parse_content_length(b"100, 200"), None);
        assert_eq!(parse_content_length(b"-1"), None);
        assert_eq!(parse_content_length(b"+5"), None);
        assert_eq!(parse_content_length(b"100.5"), None);
        assert_eq!(parse_content_length(b""), None);
    }
}

//! Content-type sniffing
//!
//! Classifies a file from its first 512 bytes: well-known magic numbers,
//! then an HTML prefix scan, then a UTF-8 text check. Unknown binary data
//! falls back to `application/octet-stream`.

/// How many leading bytes callers should feed [`sniff_mime`]
pub const SNIFF_LEN: usize = 512;

const MAGICS: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b\x08", "application/x-gzip"),
    (b"OggS", "application/ogg"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"fLaC", "audio/flac"),
];

const HTML_PREFIXES: &[&str] = &[
    "<!doctype html",
    "<html",
    "<head",
    "<body",
    "<script",
    "<iframe",
    "<h1",
    "<div",
    "<table",
    "<a",
    "<style",
    "<title",
    "<b",
    "<br",
    "<p",
    "<!--",
];

/// Sniff the MIME type of content from its leading bytes
pub fn sniff_mime(head: &[u8]) -> String {
    for (magic, mime) in MAGICS {
        if head.starts_with(magic) {
            return (*mime).to_string();
        }
    }

    // RIFF containers: WEBP and WAV share the outer magic
    if head.len() >= 12 && &head[0..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return "image/webp".to_string(),
            b"WAVE" => return "audio/wave".to_string(),
            _ => {}
        }
    }

    let trimmed = trim_leading_ws(head);
    if let Ok(text) = std::str::from_utf8(trimmed) {
        let lower = text.to_ascii_lowercase();
        for prefix in HTML_PREFIXES {
            if lower.starts_with(prefix) {
                return "text/html; charset=utf-8".to_string();
            }
        }
    }

    if looks_like_text(head) {
        "text/plain; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

fn trim_leading_ws(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn looks_like_text(data: &[u8]) -> bool {
    if std::str::from_utf8(data).is_err() {
        // The sniff window may cut a multi-byte sequence short; only the
        // tail may be invalid.
        let mut end = data.len();
        while end > data.len().saturating_sub(4) {
            if std::str::from_utf8(&data[..end]).is_ok() {
                break;
            }
            end -= 1;
        }
        if std::str::from_utf8(&data[..end]).is_err() {
            return false;
        }
    }

    // Control bytes other than whitespace mean binary
    !data
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | 0x1b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        assert_eq!(sniff_mime(b"hello"), "text/plain; charset=utf-8");
        assert_eq!(sniff_mime(b"line one\nline two\n"), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_png_magic() {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(sniff_mime(&data), "image/png");
    }

    #[test]
    fn test_jpeg_magic() {
        assert_eq!(sniff_mime(b"\xff\xd8\xff\xe0JFIF"), "image/jpeg");
    }

    #[test]
    fn test_html() {
        assert_eq!(
            sniff_mime(b"  <!DOCTYPE html><html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(sniff_mime(b"<html><body>"), "text/html; charset=utf-8");
    }

    #[test]
    fn test_binary_fallback() {
        let data = [0u8, 1, 2, 3, 0xfe, 0xff];
        assert_eq!(sniff_mime(&data), "application/octet-stream");
    }

    #[test]
    fn test_pdf() {
        assert_eq!(sniff_mime(b"%PDF-1.7 rest"), "application/pdf");
    }

    #[test]
    fn test_webp_riff() {
        let mut data = b"RIFF".to_vec();
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(b"WEBP");
        assert_eq!(sniff_mime(&data), "image/webp");
    }

    #[test]
    fn test_truncated_utf8_still_text() {
        // Multi-byte char cut at the sniff boundary
        let mut data = "héllo wörld ".repeat(10).into_bytes();
        data.truncate(data.len() - 1);
        assert_eq!(sniff_mime(&data), "text/plain; charset=utf-8");
    }
}

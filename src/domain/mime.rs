/// Server-side MIME detection over a byte prefix. Magic numbers only; the
/// client-declared type is never trusted. Returns `None` when nothing
/// recognizable is found, which callers treat as `unsupported_mime`.
pub fn detect_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"%PDF-") {
        return Some("application/pdf");
    }

    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }

    // JPEG SOI marker, covers JFIF and Exif headers
    if data.starts_with(b"\xff\xd8\xff") {
        return Some("image/jpeg");
    }

    // XLSX: a ZIP container that names [Content_Types].xml early on
    if data.starts_with(b"PK\x03\x04") && contains(&data[..data.len().min(4096)], b"[Content_Types].xml")
    {
        return Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet");
    }

    let stripped = trim_ascii_start(data);

    // JSON: first non-whitespace byte opens an object or array
    if matches!(stripped.first(), Some(b'{') | Some(b'[')) {
        return Some("application/json");
    }

    if stripped.starts_with(b"<?xml") || stripped.starts_with(b"<") {
        return Some("application/xml");
    }

    // CSV heuristic: a UTF-8 prefix with both commas and newlines
    if let Ok(prefix) = std::str::from_utf8(&stripped[..stripped.len().min(1024)]) {
        if prefix.contains(',') && prefix.contains('\n') {
            return Some("text/csv");
        }
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut rest = data;
    while let [first, tail @ ..] = rest {
        if first.is_ascii_whitespace() {
            rest = tail;
        } else {
            break;
        }
    }
    rest
}

use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use url::Url;

/// Last non-empty path segment, percent-decoded. URLs without one get a
/// name derived from the URL itself so reruns find the same segment files.
pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return percent_decode_str(filename).decode_utf8_lossy().into_owned();
            }
        }
    }

    fallback_filename(url)
}

pub fn fallback_filename(url: &Url) -> String {
    format!(
        "download_{}",
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, url.as_str().as_bytes())
    )
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Sanitized `filename`, or `None` when it would not name a file in the
/// output directory (empty, `.` or `..`).
pub fn usable_filename(filename: &str) -> Option<String> {
    let name = sanitize_filename(filename.trim());
    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// Extracts the `filename` parameter of a `Content-Disposition` value.
///
/// Parameters are `key=value` pairs separated by `;`. Values may be quoted,
/// with `\` escaping the next character inside quotes. `filename*` (RFC 5987)
/// wins over `filename` when both are present and decodable.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for (key, val) in disposition_params(value) {
        match key.to_ascii_lowercase().as_str() {
            "filename" if !val.is_empty() => plain = Some(val),
            "filename*" => extended = decode_ext_value(&val),
            _ => {}
        }
    }

    extended.or(plain).filter(|name| !name.trim().is_empty())
}

fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = value.chars().peekable();

    // Skip the disposition type.
    for c in chars.by_ref() {
        if c == ';' {
            break;
        }
    }

    loop {
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            chars.next();
            if c == '=' || c == ';' {
                if c == ';' {
                    key.clear();
                    continue;
                }
                break;
            }
            key.push(c);
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            break;
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut val = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            val.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => val.push(c),
                }
            }
            // Drop anything up to the next separator.
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
            }
        } else {
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
                val.push(c);
            }
            val = val.trim().to_string();
        }

        params.push((key, val));
    }

    params
}

/// Decodes `charset'lang'pct-encoded` values. Only UTF-8 and ASCII charsets are accepted.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _lang = parts.next()?;
    let encoded = parts.next()?;

    if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("us-ascii") {
        return None;
    }

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// `<dir>/<file_name>.part<index>`
pub fn segment_path(dir: &Path, file_name: &str, index: usize) -> PathBuf {
    dir.join(format!("{}.part{}", file_name, index))
}

pub fn format_eta(seconds: u64) -> String {
    let mins = seconds / 60;
    let secs = seconds % 60;
    if mins >= 60 {
        format!("{}h {}m", mins / 60, mins % 60)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

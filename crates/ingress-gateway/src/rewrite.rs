//! HTML rewriting for apps served below an ingress path prefix.
//!
//! The app server renders root-relative URLs (`/_next/...`, `/dishes`). Behind
//! the ingress those must carry the per-installation prefix, so the HTML is
//! patched with plain literal substitutions. This can over-match inside inline
//! scripts, comments or `<pre>` blocks; parsing the document is out of scope.

/// Attribute openers whose root-relative URLs get the prefix, in rewrite order.
const URL_MARKERS: [&str; 3] = ["href=\"/", "src=\"/", "\"/_next/"];

/// Trim a raw ingress header value into a usable prefix.
///
/// Trailing slashes are dropped and a leading slash is ensured. Returns `None`
/// when nothing remains, which disables rewriting.
pub fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

/// Whether a `content-type` value denotes an HTML document.
pub fn is_html(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..9)
        .is_some_and(|mime| mime.eq_ignore_ascii_case("text/html"))
}

/// Apply the ingress prefix to a document.
///
/// Inserts a `<base>` tag and prefixes root-relative `href`, `src` and
/// `"/_next/` references. URLs that already carry the prefix and
/// protocol-relative URLs are left alone, so rewriting twice changes nothing.
pub fn rewrite_html(html: &str, prefix: &str) -> String {
    let Some(prefix) = normalize_prefix(prefix) else {
        return html.to_string();
    };

    let mut out = insert_base_tag(html, &prefix);
    for marker in URL_MARKERS {
        out = prefix_urls(&out, marker, &prefix);
    }
    out
}

/// Insert `<base href="{prefix}/">` right after the opening `<head>` tag.
///
/// Nothing is inserted when the document already has a `<base` tag or has no
/// head tag at all.
fn insert_base_tag(html: &str, prefix: &str) -> String {
    // ASCII lowercasing keeps byte offsets identical to `html`.
    let lower = html.to_ascii_lowercase();
    if lower.contains("<base") {
        return html.to_string();
    }
    let Some(insert_at) = head_tag_end(&lower) else {
        return html.to_string();
    };

    let base = format!("<base href=\"{prefix}/\">");
    let mut out = String::with_capacity(html.len() + base.len());
    out.push_str(&html[..insert_at]);
    out.push_str(&base);
    out.push_str(&html[insert_at..]);
    out
}

/// Byte offset just past the `>` of the first `<head>` / `<head ...>` tag.
fn head_tag_end(lower: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(found) = lower[from..].find("<head") {
        let start = from + found;
        let after = start + "<head".len();
        match lower[after..].chars().next() {
            Some(c) if c == '>' || c == '/' || c.is_ascii_whitespace() => {
                return lower[after..].find('>').map(|close| after + close + 1);
            }
            // `<header>` and friends
            _ => from = after,
        }
    }
    None
}

fn prefix_urls(html: &str, marker: &str, prefix: &str) -> String {
    let path_offset = marker.find('/').unwrap_or(marker.len());
    let mut out = String::with_capacity(html.len());
    let mut copied = 0;

    for (index, _) in html.match_indices(marker) {
        let path_start = index + path_offset;
        let path = &html[path_start..];
        if path.starts_with("//") || is_prefixed(path, prefix) {
            continue;
        }
        out.push_str(&html[copied..path_start]);
        out.push_str(prefix);
        copied = path_start;
    }

    out.push_str(&html[copied..]);
    out
}

fn is_prefixed(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix).is_some_and(|rest| {
        rest.is_empty() || rest.starts_with(['/', '"', '\'', '?', '#'])
    })
}

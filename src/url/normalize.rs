use crate::{UrlError, UrlResult};
use url::Url;

/// Query parameters that carry session or tracking state rather than content
const VOLATILE_PARAMS: &[&str] = &[
    "phpsessid",
    "sid",
    "jsessionid",
    "fbclid",
    "gclid",
    "mc_eid",
    "topicseen",
];

/// Normalizes a source address into a work item identifier
///
/// Two addresses that point at the same document must produce the same
/// identifier, otherwise the dedup store sees them as different items.
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed
/// 2. Require http or https
/// 3. Lowercase the host
/// 4. Normalize path:
///    - Collapse empty and `.` segments, resolve `..`
///    - Remove trailing slash (except for root /)
/// 5. Remove fragment
/// 6. Remove session and tracking query parameters (`PHPSESSID`, `sid`, `utm_*`, ...)
/// 7. Drop forum view state that does not change the page (`;topicseen`,
///    the `.msgN` anchor after an explicit topic offset)
/// 8. Sort the `&`-separated groups by key; `;`-separated parameters inside
///    a group keep their order
/// 9. Remove empty query string
///
/// Query segments keep their original bytes, so the normalized address is
/// still the one the server expects (`;` separators, bare flags, `%20`).
///
/// # Examples
///
/// ```
/// use lurker::url::normalize_url;
///
/// let url = normalize_url("http://Forum.Example.ORG/index.php/?topic=12&PHPSESSID=abc#msg3").unwrap();
/// assert_eq!(url.as_str(), "http://forum.example.org/index.php?topic=12");
/// ```
pub fn normalize_url(url_str: &str) -> UrlResult<Url> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(url.scheme().to_string()));
    }

    // The url crate already lowercases registrable hosts; IP literals pass through.
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);

    url.set_fragment(None);

    if let Some(raw) = url.query() {
        let query = normalize_query(raw);

        if query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&query));
        }
    }

    Ok(url)
}

/// Normalizes a URL path by removing dot segments and trailing slashes
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Filters volatile segments out of a raw query and sorts its groups
///
/// Groups are separated by `&`. Inside a group, SMF-style `;` parameters
/// (`action=recent;start=10`) are positional and stay in order.
fn normalize_query(raw: &str) -> String {
    let mut groups: Vec<Vec<String>> = raw
        .split('&')
        .map(|group| {
            group
                .split(';')
                .filter(|segment| !segment.is_empty() && !is_volatile_segment(segment))
                .map(strip_message_anchor)
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect();

    // Stable sort keeps repeated keys in their original order
    groups.sort_by(|a, b| segment_key(&a[0]).cmp(segment_key(&b[0])));

    groups
        .iter()
        .map(|group| group.join(";"))
        .collect::<Vec<_>>()
        .join("&")
}

fn segment_key(segment: &str) -> &str {
    segment.split_once('=').map_or(segment, |(key, _)| key)
}

fn is_volatile_segment(segment: &str) -> bool {
    let key = segment_key(segment).to_ascii_lowercase();
    VOLATILE_PARAMS.contains(&key.as_str()) || key.starts_with("utm_")
}

/// `topic=12.30.msg456` and `topic=12.30` render the same page; the message
/// only moves the browser. Without an offset (`topic=12.msg456`) the message
/// picks the page, so it is kept.
fn strip_message_anchor(segment: &str) -> String {
    let Some(value) = segment.strip_prefix("topic=") else {
        return segment.to_string();
    };

    let mut parts = value.splitn(3, '.');
    let (Some(id), Some(offset), Some(anchor)) = (parts.next(), parts.next(), parts.next()) else {
        return segment.to_string();
    };

    let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let is_message = anchor
        .strip_prefix("msg")
        .map_or(false, |digits| is_number(digits));

    if is_number(id) && is_number(offset) && is_message {
        format!("topic={}.{}", id, offset)
    } else {
        segment.to_string()
    }
}

use url::Url;

/// Returns the origin host used for per-host scheduling and circuit breaking
///
/// The host is lowercased and carries the port only when it differs from the
/// scheme default, so `http://a.org/` and `http://a.org:80/` share a host key
/// while two local servers on different ports do not.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use lurker::url::origin_host;
///
/// let url = Url::parse("https://Example.com/path").unwrap();
/// assert_eq!(origin_host(&url), Some("example.com".to_string()));
///
/// let url = Url::parse("http://127.0.0.1:8080/").unwrap();
/// assert_eq!(origin_host(&url), Some("127.0.0.1:8080".to_string()));
/// ```
pub fn origin_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    match url.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host),
    }
}

/// Strips the port from a host key, for matching against host patterns
pub fn host_name(host_key: &str) -> &str {
    // IPv6 literals keep their brackets and colons
    if host_key.starts_with('[') {
        return match host_key.find(']') {
            Some(end) => &host_key[..=end],
            None => host_key,
        };
    }
    host_key.split(':').next().unwrap_or(host_key)
}

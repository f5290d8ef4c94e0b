//! Request-target helpers.

/// Returns the origin-relative part of a request target.
///
/// A request line may carry an absolute-form target (`http://host:80/foo?q=1`),
/// typically when the client talks to a proxy. Everything up to the first
/// `/`, `?` or `#` after `scheme://authority` is dropped. Targets that are
/// already origin-relative come back unchanged.
///
/// ```rust
/// use hourglass::uri::origin_path;
///
/// assert_eq!(origin_path("http://host:80/foo?q=1"), "/foo?q=1");
/// assert_eq!(origin_path("https://host/foo"), "/foo");
/// assert_eq!(origin_path("/foo"), "/foo");
/// ```
pub fn origin_path(uri: &str) -> &str {
    let bytes = uri.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'/' | b'?' | b'#' => break,
            b':' if bytes[i + 1..].starts_with(b"//") => {
                let authority = i + 3;
                return match bytes[authority..].iter().position(|c| matches!(c, b'/' | b'?' | b'#')) {
                    Some(offset) => &uri[authority + offset..],
                    // `http://host` has no origin part at all.
                    None => "",
                };
            }
            _ => {}
        }
    }
    uri
}

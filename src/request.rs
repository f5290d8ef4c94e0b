//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use http_body_util::BodyExt;

use crate::uri::origin_path;

/// An incoming HTTP request, with its body fully read.
///
/// Cheap to clone: the body is reference counted.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) path: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
}

impl Request {
    /// Reads a hyper request off the wire.
    ///
    /// Fails only if the body stream errors before it ends.
    pub(crate) async fn from_hyper<B>(
        req: hyper::Request<B>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<Self, B::Error>
    where
        B: hyper::body::Body,
    {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        let path = origin_path(&parts.uri.to_string()).to_owned();
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            path,
            headers: parts.headers,
            body,
            params: HashMap::new(),
            remote_addr: Some(remote_addr),
            local_addr: Some(local_addr),
        })
    }

    /// Builder for requests that do not come from a socket (tests, replays).
    pub fn builder() -> RequestBuilder {
        RequestBuilder {
            method: Method::GET,
            uri: Uri::from_static("/"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            local_addr: None,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }
    pub fn local_addr(&self) -> Option<SocketAddr> { self.local_addr }

    /// Origin-relative request target, including any query string.
    ///
    /// Absolute-form targets (`http://host/x?y`) are reduced to `/x?y`.
    pub fn target(&self) -> &str { &self.path }

    /// Path component only, without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// `http` unless the target carried another scheme.
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    /// Host from the absolute-form target, or else the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri.host().or_else(|| {
            self.header("host").map(|h| h.split(':').next().unwrap_or(h))
        })
    }

    /// Case-insensitive header lookup. Non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All cookies sent with the request, in order. Empty if there are none.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        self.headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim(), value.trim().trim_matches('"')))
            })
            .filter(|(name, _)| !name.is_empty())
            .collect()
    }

    /// First cookie with the given name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().into_iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

// ── RequestBuilder ───────────────────────────────────────────────────────────

pub struct RequestBuilder {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request target. Unparseable targets are replaced with `/`.
    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = uri.parse().unwrap_or_else(|_| Uri::from_static("/"));
        self
    }

    /// Appends a header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn build(self) -> Request {
        let path = origin_path(&self.uri.to_string()).to_owned();
        Request {
            method: self.method,
            uri: self.uri,
            path,
            headers: self.headers,
            body: self.body,
            params: HashMap::new(),
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
        }
    }
}

//! HTTP client abstraction used by [`UpdateFetcher`](crate::fetch::UpdateFetcher).
//!
//! The fetcher only ever issues `GET` requests with a handful of headers, so
//! the seam is deliberately small:
//!
//! ```text
//! GET <base>/api/setup/   - register device (ID, Accept, Content-Type)
//! GET <base>/api/display  - display payload (ID, Access-Token, battery-level, ...)
//! GET <image_url>         - rendered image (Accept: image/*)
//! ```

use core::future::Future;

use crate::error::TransportError;

// ============================================================================
// HTTP Client Trait
// ============================================================================

/// HTTP client trait.
///
/// # Implementation Notes
///
/// - Non-2xx statuses are *responses*, not errors; return them as
///   [`HttpResponse`] so the caller can report code and body
/// - Return [`TransportError`] only when no response was obtained
/// - Apply connect/read timeouts; the cycle's own timeouts are an outer bound
pub trait HttpClient: Send + Sync {
    /// Perform a `GET` request.
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

/// An outgoing HTTP request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs, in insertion order.
    pub headers: Vec<(&'static str, String)>,
}

impl HttpRequest {
    /// Start a `GET` request for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Look up a header value (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received HTTP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code (e.g., 200, 404, 500).
    pub status: u16,
    /// Response body as bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a 200 OK response with the given body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Creates a 200 OK response with JSON content.
    pub fn ok_json(body: &str) -> Self {
        Self::ok(body.as_bytes().to_vec())
    }

    /// Creates a response with the given status code and text body.
    pub fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: message.as_bytes().to_vec(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the body as a UTF-8 string, if valid.
    pub fn body_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.body).ok()
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_headers_are_case_insensitive() {
        let req = HttpRequest::get("http://x/api/display")
            .header("Access-Token", "abc")
            .header("png-width", "600");
        assert_eq!(req.header_value("access-token"), Some("abc"));
        assert_eq!(req.header_value("PNG-WIDTH"), Some("600"));
        assert_eq!(req.header_value("rssi"), None);
    }

    #[test]
    fn response_success_range() {
        assert!(HttpResponse::ok("x").is_success());
        assert!(HttpResponse::error(204, "").is_success());
        assert!(!HttpResponse::error(301, "moved").is_success());
        assert!(!HttpResponse::error(500, "boom").is_success());
    }

    #[test]
    fn response_body_helpers() {
        let res = HttpResponse::ok_json(r#"{"a":1}"#);
        assert_eq!(res.body_str(), Some(r#"{"a":1}"#));

        let res = HttpResponse::ok(vec![0xff, b'a']);
        assert_eq!(res.body_str(), None);
        assert!(res.body_lossy().ends_with('a'));
    }
}

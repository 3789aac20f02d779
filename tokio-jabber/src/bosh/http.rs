//! HTTP transport for BOSH sessions.

use core::future::Future;
use core::time::Duration;
use std::io;

use crate::error::Error;

/// Reply to a POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body, as text
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something which can POST a BOSH body and return the reply.
///
/// Implementations report transport failures as
/// [`Error::TransportWrite`] or [`Error::TransportRead`]; HTTP status codes
/// are returned as-is and checked by the session.
pub trait HttpClient: Send + Sync {
    /// POST `body` to `url` with `Content-Type: text/xml; charset=utf-8`.
    fn post(
        &self,
        url: &str,
        body: String,
    ) -> impl Future<Output = Result<HttpResponse, Error>> + Send;
}

/// [`HttpClient`] backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client whose requests time out after `timeout`.
    ///
    /// The timeout must exceed the `wait` the session asks the connection
    /// manager for.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::TransportWrite(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(Self { inner })
    }
}

/// Failures while the connection manager holds the request, or while its
/// reply arrives, are read errors. Everything else failed the write.
fn send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_body() || e.is_decode() {
        Error::TransportRead(io::Error::new(io::ErrorKind::Other, e))
    } else {
        Error::TransportWrite(io::Error::new(io::ErrorKind::Other, e))
    }
}

impl HttpClient for ReqwestClient {
    async fn post(&self, url: &str, body: String) -> Result<HttpResponse, Error> {
        let response = self
            .inner
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(send_error)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::TransportRead(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok(HttpResponse { status, body })
    }
}

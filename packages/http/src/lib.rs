//! HTTP client abstraction for packbox.
//!
//! Everything that talks to the registry CDN goes through the [`HttpClient`]
//! trait. The `reqwest` backend makes real network requests; the `simulator`
//! backend serves a programmable route table and counts requests, which is
//! what the memoisation and retry tests run against.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[cfg(feature = "reqwest")]
pub mod reqwest;

#[cfg(feature = "simulator")]
pub mod simulator;

/// Errors that can occur when making HTTP requests.
#[derive(Debug, Error)]
pub enum Error {
    #[cfg(feature = "reqwest")]
    #[error(transparent)]
    Reqwest(#[from] ::reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[cfg(feature = "simulator")]
    #[error("No simulator route for {0}")]
    UnknownRoute(String),
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: Bytes,
}

impl Response {
    #[must_use]
    pub const fn new(status: u16, body: Bytes) -> Self {
        Self { status, body }
    }

    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// The body bytes, or a status error when outside the 2xx range.
    ///
    /// # Errors
    ///
    /// * If the status is outside the 2xx range
    pub fn ok_bytes(self, url: &str) -> Result<Bytes, Error> {
        if self.is_ok() {
            Ok(self.body)
        } else {
            Err(Error::Status {
                status: self.status,
                url: url.to_string(),
            })
        }
    }
}

/// Generic GET-capable HTTP client.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue a GET request and buffer the full response.
    ///
    /// # Errors
    ///
    /// * If the request fails to send or the body fails to download
    async fn get(&self, url: &str) -> Result<Response, Error>;
}

/// GET with a hard deadline.
///
/// # Errors
///
/// * If the request fails or `timeout` elapses first
pub async fn get_with_timeout(
    client: &dyn HttpClient,
    url: &str,
    timeout: Duration,
) -> Result<Response, Error> {
    tokio::time::timeout(timeout, client.get(url))
        .await
        .map_err(|_| Error::Timeout {
            url: url.to_string(),
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn response_ok_bytes_passes_2xx_through() {
        let response = Response::new(200, Bytes::from_static(b"body"));
        assert_eq!(
            response.ok_bytes("http://x").unwrap(),
            Bytes::from_static(b"body")
        );
    }

    #[test_log::test]
    fn response_ok_bytes_rejects_non_2xx() {
        let response = Response::new(404, Bytes::new());
        let err = response.ok_bytes("http://x/y").unwrap_err();
        assert_eq!(err.to_string(), "HTTP status 404 from http://x/y");
    }
}

//! Reqwest HTTP client backend.
//!
//! Only available when the `reqwest` feature is enabled.

use async_trait::async_trait;

use crate::{Error, HttpClient, Response};

/// Production client backed by a shared `reqwest::Client`.
pub struct Client(reqwest::Client);

impl Client {
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self(client)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self(reqwest::Client::new())
    }
}

#[async_trait]
impl HttpClient for Client {
    async fn get(&self, url: &str) -> Result<Response, Error> {
        let response = self.0.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(Response::new(status, body))
    }
}

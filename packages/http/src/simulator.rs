//! Simulator HTTP backend.
//!
//! Routes are programmed per URL as a sequence of steps; the final step
//! repeats forever. Every request is recorded so tests can assert how many
//! network calls a code path issued.

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Error, HttpClient, Response};

/// One programmed response step.
#[derive(Debug, Clone)]
pub enum Step {
    Bytes(Bytes),
    Status(u16),
}

#[derive(Default)]
pub struct SimulatorClient {
    routes: RwLock<HashMap<String, Vec<Step>>>,
    requests: Mutex<Vec<String>>,
}

impl SimulatorClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Program a URL to always return `body` with status 200.
    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.insert_steps(url, vec![Step::Bytes(body.into())]);
    }

    /// Program a URL with an explicit step sequence. The last step repeats.
    pub fn insert_steps(&self, url: impl Into<String>, steps: Vec<Step>) {
        self.routes.write().unwrap().insert(url.into(), steps);
    }

    /// Every URL requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests made to `url`.
    #[must_use]
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|x| x.as_str() == url)
            .count()
    }
}

#[async_trait]
impl HttpClient for SimulatorClient {
    async fn get(&self, url: &str) -> Result<Response, Error> {
        self.requests.lock().unwrap().push(url.to_string());

        let mut routes = self.routes.write().unwrap();
        let Some(steps) = routes.get_mut(url) else {
            return Err(Error::UnknownRoute(url.to_string()));
        };

        let step = if steps.len() > 1 {
            steps.remove(0)
        } else {
            steps[0].clone()
        };

        Ok(match step {
            Step::Bytes(body) => Response::new(200, body),
            Step::Status(status) => Response::new(status, Bytes::new()),
        })
    }
}

//! HTTP validation probe used to explain failed socket connects

use crate::error::{Error, Result};
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait Validator: Send + Sync {
    /// GET the validation endpoint and return the server's explanation
    async fn validate(&self, url: &Url) -> Result<String>;
}

pub struct HttpValidator {
    client: reqwest::Client,
}

impl HttpValidator {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, url: &Url) -> Result<String> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("Validation returned {} ({} bytes)", status, body.len());

        if body.trim().is_empty() {
            if status.is_success() {
                return Err(Error::Network("validation returned no data".to_string()));
            }
            return Err(Error::Network(format!("validation failed with {}", status)));
        }
        Ok(body)
    }
}

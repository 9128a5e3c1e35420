use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::CacheError;

/// A durable, unauthenticated download link for one cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicLink {
    pub id: String,
    pub download_url: String,
}

pub trait PublicLinkService: Send + Sync {
    /// Create a link that bypasses any cached copy of `file_url`.
    fn create_forced_link(&self, file_url: &str) -> Result<PublicLink, CacheError>;
    fn delete_link(&self, id: &str) -> Result<(), CacheError>;
}

impl<T: PublicLinkService + ?Sized> PublicLinkService for Arc<T> {
    fn create_forced_link(&self, file_url: &str) -> Result<PublicLink, CacheError> {
        (**self).create_forced_link(file_url)
    }

    fn delete_link(&self, id: &str) -> Result<(), CacheError> {
        (**self).delete_link(id)
    }
}

#[derive(Clone)]
pub struct PostitHttpClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PostitEnvelope {
    result: PostitResult,
}

#[derive(Deserialize)]
struct PostitResult {
    #[serde(alias = "postit", alias = "uuid")]
    id: String,
    #[serde(default)]
    redeem_url: Option<String>,
    #[serde(rename = "_links", default)]
    links: Option<Value>,
}

impl PostitHttpClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, CacheError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("adc-cache/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CacheError::PostitHttp(err.to_string()))?,
        );
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| CacheError::PostitHttp(err.to_string()))?,
            );
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| CacheError::PostitHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn postits_url(&self) -> String {
        format!("{}/postits/v2/", self.base_url)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, CacheError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "postit request failed".to_string());
        Err(CacheError::PostitStatus { status, message })
    }
}

impl PublicLinkService for PostitHttpClient {
    fn create_forced_link(&self, file_url: &str) -> Result<PublicLink, CacheError> {
        let body = json!({
            "url": forced_url(file_url),
            "method": "GET",
            "unlimited": true,
            "noauth": true,
        });
        let response = self
            .client
            .post(self.postits_url())
            .json(&body)
            .send()
            .map_err(|err| CacheError::PostitHttp(err.to_string()))?;
        let envelope: PostitEnvelope = Self::handle_status(response)?
            .json()
            .map_err(|err| CacheError::PostitHttp(err.to_string()))?;
        let download_url = envelope
            .result
            .redeem_url
            .clone()
            .or_else(|| {
                envelope
                    .result
                    .links
                    .as_ref()
                    .and_then(|links| links.pointer("/self/href"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| CacheError::PostitHttp("postit response has no URL".to_string()))?;
        Ok(PublicLink {
            id: envelope.result.id,
            download_url,
        })
    }

    fn delete_link(&self, id: &str) -> Result<(), CacheError> {
        let url = format!("{}{}", self.postits_url(), id);
        let response = self
            .client
            .delete(url)
            .send()
            .map_err(|err| CacheError::PostitHttp(err.to_string()))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

fn forced_url(file_url: &str) -> String {
    if file_url.contains("force=true") {
        return file_url.to_string();
    }
    let separator = if file_url.contains('?') { '&' } else { '?' };
    format!("{file_url}{separator}force=true")
}

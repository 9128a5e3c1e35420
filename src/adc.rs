use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::domain::{AsyncQueryStatus, Repository};
use crate::error::CacheError;

/// Query surface of one ADC repository.
pub trait RepositoryClient: Send + Sync {
    fn list_studies(&self, repository: &Repository) -> Result<Vec<String>, CacheError>;
    fn list_repertoires(
        &self,
        repository: &Repository,
        study_id: &str,
    ) -> Result<Vec<Value>, CacheError>;
    /// Streams every rearrangement of the repertoire as TSV into `destination`.
    fn download_rearrangements(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        destination: &Path,
    ) -> Result<(), CacheError>;
    fn submit_async_query(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        notify_url: &str,
    ) -> Result<String, CacheError>;
    fn poll_async_status(
        &self,
        repository: &Repository,
        query_id: &str,
    ) -> Result<AsyncQueryStatus, CacheError>;
    fn download_async_result(
        &self,
        repository: &Repository,
        final_file: &str,
        destination: &Path,
    ) -> Result<(), CacheError>;
}

impl<T: RepositoryClient + ?Sized> RepositoryClient for Arc<T> {
    fn list_studies(&self, repository: &Repository) -> Result<Vec<String>, CacheError> {
        (**self).list_studies(repository)
    }

    fn list_repertoires(
        &self,
        repository: &Repository,
        study_id: &str,
    ) -> Result<Vec<Value>, CacheError> {
        (**self).list_repertoires(repository, study_id)
    }

    fn download_rearrangements(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        (**self).download_rearrangements(repository, repertoire_id, destination)
    }

    fn submit_async_query(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        notify_url: &str,
    ) -> Result<String, CacheError> {
        (**self).submit_async_query(repository, repertoire_id, notify_url)
    }

    fn poll_async_status(
        &self,
        repository: &Repository,
        query_id: &str,
    ) -> Result<AsyncQueryStatus, CacheError> {
        (**self).poll_async_status(repository, query_id)
    }

    fn download_async_result(
        &self,
        repository: &Repository,
        final_file: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        (**self).download_async_result(repository, final_file, destination)
    }
}

#[derive(Clone)]
pub struct AdcHttpClient {
    client: Client,
}

#[derive(Deserialize)]
struct FacetResponse {
    #[serde(rename = "Facet", default)]
    facet: Vec<Value>,
}

#[derive(Deserialize)]
struct RepertoireResponse {
    #[serde(rename = "Repertoire", default)]
    repertoire: Vec<Value>,
}

#[derive(Deserialize)]
struct AsyncSubmitResponse {
    query_id: String,
}

impl AdcHttpClient {
    pub fn new() -> Result<Self, CacheError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("adc-cache/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CacheError::AdcHttp(err.to_string()))?,
        );
        // Rearrangement downloads can run for a long time; the timeout bounds a
        // stalled transfer, not a slow one.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(6 * 60 * 60))
            .build()
            .map_err(|err| CacheError::AdcHttp(err.to_string()))?;
        Ok(Self { client })
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
            .unwrap_or_else(|_| "ADC request failed".to_string());
        Err(CacheError::AdcStatus { status, message })
    }

    fn write_response_to_file(
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<(), CacheError> {
        let mut file = File::create(destination).map_err(|err| {
            CacheError::Filesystem(format!("create {}: {err}", destination.display()))
        })?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| CacheError::AdcHttp(format!("stream to {}: {err}", destination.display())))?;
        Ok(())
    }

    fn send_once(
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, CacheError> {
        let response = request
            .send()
            .map_err(|err| CacheError::AdcHttp(err.to_string()))?;
        Self::handle_status(response)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CacheError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Self::handle_status(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(CacheError::AdcHttp(err.to_string()));
                }
            }
        }
    }

    fn async_endpoint(repository: &Repository, endpoint: &str) -> Result<String, CacheError> {
        repository.async_url(endpoint).ok_or_else(|| {
            CacheError::AdcHttp(format!(
                "repository {} has no async host",
                repository.repository_id
            ))
        })
    }
}

impl RepositoryClient for AdcHttpClient {
    fn list_studies(&self, repository: &Repository) -> Result<Vec<String>, CacheError> {
        let url = repository.query_url("repertoire");
        let body = study_facet_query();
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let facets: FacetResponse = response
            .json()
            .map_err(|err| CacheError::AdcResponse(err.to_string()))?;
        Ok(study_ids_from_facets(&facets.facet))
    }

    fn list_repertoires(
        &self,
        repository: &Repository,
        study_id: &str,
    ) -> Result<Vec<Value>, CacheError> {
        let url = repository.query_url("repertoire");
        let body = json!({
            "filters": {
                "op": "=",
                "content": { "field": "study.study_id", "value": study_id }
            }
        });
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        let parsed: RepertoireResponse = response
            .json()
            .map_err(|err| CacheError::AdcResponse(err.to_string()))?;
        Ok(parsed.repertoire)
    }

    fn download_rearrangements(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        let url = repository.query_url("rearrangement");
        let body = rearrangement_query(repertoire_id, None);
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        Self::write_response_to_file(response, destination)
    }

    fn submit_async_query(
        &self,
        repository: &Repository,
        repertoire_id: &str,
        notify_url: &str,
    ) -> Result<String, CacheError> {
        let url = Self::async_endpoint(repository, "rearrangement")?;
        let body = rearrangement_query(repertoire_id, Some(notify_url));
        // Not retried: a lost response may still have created the query, and
        // the next cycle resubmits.
        let response = Self::send_once(self.client.post(&url).json(&body))?;
        let submitted: AsyncSubmitResponse = response
            .json()
            .map_err(|err| CacheError::AdcResponse(err.to_string()))?;
        Ok(submitted.query_id)
    }

    fn poll_async_status(
        &self,
        repository: &Repository,
        query_id: &str,
    ) -> Result<AsyncQueryStatus, CacheError> {
        let url = Self::async_endpoint(repository, &format!("status/{query_id}"))?;
        let response = self.send_with_retries(|| self.client.get(&url))?;
        response
            .json()
            .map_err(|err| CacheError::AdcResponse(err.to_string()))
    }

    fn download_async_result(
        &self,
        repository: &Repository,
        final_file: &str,
        destination: &Path,
    ) -> Result<(), CacheError> {
        let url = Self::async_endpoint(
            repository,
            &format!("results/{}", final_file.trim_start_matches('/')),
        )?;
        let response = self.send_with_retries(|| self.client.get(&url))?;
        Self::write_response_to_file(response, destination)
    }
}

fn study_facet_query() -> Value {
    json!({ "facets": "study.study_id" })
}

fn rearrangement_query(repertoire_id: &str, notify_url: Option<&str>) -> Value {
    let mut body = json!({
        "filters": {
            "op": "=",
            "content": { "field": "repertoire_id", "value": repertoire_id }
        },
        "format": "tsv"
    });
    if let Some(url) = notify_url {
        body["notification"] = Value::String(url.to_string());
    }
    body
}

fn study_ids_from_facets(facets: &[Value]) -> Vec<String> {
    let mut ids = facets
        .iter()
        .filter_map(|facet| facet.get("study.study_id"))
        .filter_map(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    ids
}

pub fn repertoire_id_of(repertoire: &Value) -> Option<&str> {
    repertoire.get("repertoire_id").and_then(Value::as_str)
}

/// Project uuid when the study was loaded from the local platform.
pub fn local_project_uuid(repertoire: &Value) -> Option<&str> {
    repertoire
        .pointer("/study/vdjserver_uuid")
        .and_then(Value::as_str)
        .filter(|uuid| !uuid.is_empty())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use thiserror::Error;

use super::types::{Request, Response};

/// A request that produced no response at all.
///
/// Error statuses are not failures: they arrive as an `Ok(Response)`.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Connection refused, DNS failure, offline, body read aborted...
  #[error("network request to {url} failed: {message}")]
  Transport { url: String, message: String },
  /// The request could not be issued in the first place
  #[error("invalid request for {url}: {message}")]
  InvalidRequest { url: String, message: String },
}

impl FetchError {
  pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
    Self::Transport {
      url: url.into(),
      message: message.to_string(),
    }
  }
}

/// The network as seen by the worker.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// HTTP network backed by reqwest
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    let built = builder.build().map_err(|e| FetchError::InvalidRequest {
      url: request.url.to_string(),
      message: e.to_string(),
    })?;

    let response = self
      .client
      .execute(built)
      .await
      .map_err(|e| FetchError::transport(request.url.as_str(), e))?;

    let status = response.status();
    let url = response.url().to_string();
    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::transport(request.url.as_str(), e))?;

    Ok(
      Response::new(status.as_u16(), body.to_vec())
        .with_url(url)
        .with_headers(headers),
    )
  }
}

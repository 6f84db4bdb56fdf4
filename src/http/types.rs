use std::fmt;

use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

/// What a request is fetching, as seen by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  /// Full-page navigation
  Document,
  Script,
  Style,
  Image,
  Font,
  Manifest,
  /// fetch()/XHR and anything without a more specific destination
  #[default]
  Empty,
}

/// An outgoing request intercepted by the worker.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      destination: Destination::Empty,
    }
  }

  /// A plain GET, as issued for subresources and manifest entries.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }

  /// Identity of this request in a cache bucket.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Cache identity of a request: method plus absolute URL without fragment.
///
/// Headers do not participate, so two requests that differ only in headers
/// share one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_ascii_uppercase(),
      url: url.into(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Parse the `"METHOD url"` form produced by `Display`.
  pub fn parse(s: &str) -> Option<Self> {
    let (method, url) = s.split_once(' ')?;
    let url = Url::parse(url).ok()?;
    let method = Method::from_bytes(method.as_bytes()).ok()?;
    Some(Self::new(&method, &url))
  }

}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Snapshot of a network response.
///
/// A snapshot owns its body outright; anything that needs to both hand a
/// response to the caller and store it takes an explicit `clone()` first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  /// Final URL after redirects, empty for synthesized responses
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();
    Self {
      url: String::new(),
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  /// Only a plain 200 is written back to a bucket. Redirect targets, partial
  /// content and every error status pass through uncached.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Hex SHA-256 over the whole snapshot: status line, headers in order,
  /// then the body. Equal digests mean there is nothing new to store.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.status.to_be_bytes());
    hasher.update(self.status_text.as_bytes());
    hasher.update([0u8]);
    for (name, value) in &self.headers {
      hasher.update(name.as_bytes());
      hasher.update([0u8]);
      hasher.update(value.as_bytes());
      hasher.update([0u8]);
    }
    hasher.update((self.body.len() as u64).to_be_bytes());
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}

#[cfg(test)]
impl Request {
  /// A top-level navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }
}

#[cfg(test)]
impl Response {
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

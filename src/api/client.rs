use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{Config, ServerConfig};

use super::transport::{Transport, TransportError};
use super::types::{ApiResponse, FetchResponse, Method, Operation};

/// Plantit API client wrapper
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  health_path: String,
}

impl ApiClient {
  pub fn new(config: &ServerConfig) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", config.url, e))?;

    let mut headers = HeaderMap::new();
    if let Some(token) = Config::get_api_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      health_path: config.health_path.clone(),
    })
  }

  fn url(&self, path: &str) -> Result<Url, TransportError> {
    self
      .base
      .join(path)
      .map_err(|e| TransportError::InvalidRequest(format!("invalid path '{}': {}", path, e)))
  }
}

impl Transport for ApiClient {
  async fn send(&self, operation: &Operation) -> Result<ApiResponse, TransportError> {
    let url = self.url(&operation.path)?;
    let method = match operation.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut request = self.http.request(method, url);
    for (name, value) in &operation.headers {
      let (name, value) = header_pair(name, value).map_err(TransportError::InvalidRequest)?;
      request = request.header(name, value);
    }
    if let Some(body) = &operation.body {
      request = request.body(body.clone());
    }

    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let body = read_json(response).await?;
    debug!(method = %operation.method, path = %operation.path, status, "write request completed");

    Ok(ApiResponse::new(status, body))
  }

  async fn fetch(&self, path: &str, token: Option<&str>) -> Result<FetchResponse, TransportError> {
    let url = self.url(path)?;
    let mut request = self.http.get(url);
    if let Some(token) = token {
      let value = HeaderValue::from_str(token)
        .map_err(|e| TransportError::InvalidRequest(format!("invalid revalidation token: {}", e)))?;
      request = request.header(IF_NONE_MATCH, value);
    }

    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();

    if status == StatusCode::NOT_MODIFIED {
      return Ok(FetchResponse::NotModified);
    }

    let token = response
      .headers()
      .get(ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = read_json(response).await?;

    if status.is_success() {
      Ok(FetchResponse::Fresh {
        token,
        payload: body,
      })
    } else {
      Ok(FetchResponse::Failed {
        status: status.as_u16(),
        body,
      })
    }
  }

  async fn probe(&self) -> Result<(), TransportError> {
    let url = self.url(&self.health_path)?;
    let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;

    if response.status().is_success() {
      Ok(())
    } else {
      Err(TransportError::Unreachable(format!(
        "health check returned {}",
        response.status()
      )))
    }
  }

  fn resolve(&self, path: &str) -> String {
    self
      .url(path)
      .map(String::from)
      .unwrap_or_else(|_| path.to_string())
  }
}

/// Parse a header pair the way reqwest will send it.
pub fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), String> {
  let header_name = HeaderName::from_bytes(name.as_bytes())
    .map_err(|e| format!("invalid header name '{}': {}", name, e))?;
  let header_value = HeaderValue::from_str(value)
    .map_err(|e| format!("invalid value for header '{}': {}", name, e))?;
  Ok((header_name, header_value))
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_decode() {
    TransportError::Protocol(e.to_string())
  } else {
    TransportError::Unreachable(e.to_string())
  }
}

/// Read the body as JSON. Empty bodies become `Null`, non-JSON text a JSON string.
async fn read_json(response: reqwest::Response) -> Result<Value, TransportError> {
  let bytes = response.bytes().await.map_err(map_reqwest_error)?;
  if bytes.is_empty() {
    return Ok(Value::Null);
  }
  Ok(
    serde_json::from_slice(&bytes)
      .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
  )
}

//! Wire-level types shared by the mutation queue and the cache layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP verbs a queued mutation can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// A write request, stored in serialized form so it survives a restart unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
  /// Path relative to the server root, e.g. `/api/v1/villages/`
  pub path: String,
  pub method: Method,
  /// Serialized JSON body
  pub body: Option<String>,
  /// Extra request headers
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl Operation {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      method,
      body: None,
      headers: BTreeMap::new(),
    }
  }

  pub fn with_json(mut self, body: &Value) -> Self {
    self.body = Some(body.to_string());
    self
      .headers
      .insert("Content-Type".to_string(), "application/json".to_string());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Check that every header can be sent as given.
  pub fn validate(&self) -> color_eyre::Result<()> {
    for (name, value) in &self.headers {
      super::client::header_pair(name, value).map_err(|e| color_eyre::eyre::eyre!(e))?;
    }
    Ok(())
  }

  pub fn headers_json(&self) -> String {
    serde_json::to_string(&self.headers).unwrap_or_else(|_| "{}".to_string())
  }
}

/// Response to a write request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  /// Parsed JSON body; `Value::Null` when the body is empty or not JSON
  pub body: Value,
}

impl ApiResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Response to a conditional GET.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
  /// 304: the stored payload is still current
  NotModified,
  /// 2xx with a body and, optionally, a new revalidation token
  Fresh { token: Option<String>, payload: Value },
  /// Any other status
  Failed { status: u16, body: Value },
}

/// Uniform error envelope: `{ "error": { "message": ..., "code": ... } }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
  pub error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
  pub message: String,
}

/// Pull the user-facing message out of an error response.
///
/// Prefers the envelope's `error.message`, then FastAPI's `detail` (a string,
/// or the first validation error's `msg`), then the status reason phrase.
pub fn error_message(status: u16, body: &Value) -> String {
  if let Ok(envelope) = serde_json::from_value::<ErrorEnvelope>(body.clone()) {
    return envelope.error.message;
  }

  match body.get("detail") {
    Some(Value::String(detail)) => return detail.clone(),
    Some(Value::Array(items)) => {
      if let Some(msg) = items
        .first()
        .and_then(|item| item.get("msg"))
        .and_then(Value::as_str)
      {
        return msg.to_string();
      }
    }
    _ => {}
  }

  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|code| code.canonical_reason())
    .map(String::from)
    .unwrap_or_else(|| format!("Request failed with status {}", status))
}

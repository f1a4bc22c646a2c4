//! JSON-RPC gateway to the backend.
//!
//! Data calls follow the `model.<modelId>.<verb>` naming convention
//! (`search`, `read`, `search_read`, `fields_view_get`, `default_get`);
//! system calls address the `ir.*` models. Paginated `search_read` calls
//! take `[domain, offset, limit, order, fieldNames]` positional parameters,
//! where the domain is a list of `[field, operator, value]` triples.

pub mod types;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ServerConfig;

/// Gateway for named RPC calls against the backend.
#[async_trait]
pub trait RpcGateway: Send + Sync {
  /// Issue one call and return the decoded result value.
  async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Issue a call and decode the result into a typed value.
pub async fn call_decoded<R, T>(rpc: &R, method: &str, params: Value) -> Result<T>
where
  R: RpcGateway,
  T: DeserializeOwned,
{
  let value = rpc.call(method, params).await?;
  serde_json::from_value(value).map_err(|e| eyre!("Failed to decode {} response: {}", method, e))
}

/// `[domain, offset, limit]` parameters for `search` calls.
pub fn search_params(domain: Value, limit: usize) -> Value {
  json!([domain, 0, limit])
}

/// `[domain, offset, limit, order, fields]` parameters for `search_read`
/// calls. A `null` order keeps the server default.
pub fn search_read_params(domain: Value, limit: usize, fields: Value) -> Value {
  json!([domain, 0, limit, null, fields])
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
  #[serde(default)]
  result: Value,
  #[serde(default)]
  error: Option<Value>,
}

/// JSON-RPC client over HTTP with basic authentication.
#[derive(Clone)]
pub struct JsonRpcClient {
  http: reqwest::Client,
  endpoint: String,
  username: String,
  password: String,
}

impl JsonRpcClient {
  pub fn new(config: &ServerConfig, password: &str) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let endpoint = format!(
      "{}/{}/",
      config.url.trim_end_matches('/'),
      config.database
    );

    Ok(Self {
      http,
      endpoint,
      username: config.username.clone(),
      password: password.to_string(),
    })
  }
}

#[async_trait]
impl RpcGateway for JsonRpcClient {
  async fn call(&self, method: &str, params: Value) -> Result<Value> {
    let request = json!({
      "id": 0,
      "method": method,
      "params": params,
    });

    let response = self
      .http
      .post(&self.endpoint)
      .basic_auth(&self.username, Some(&self.password))
      .json(&request)
      .send()
      .await
      .map_err(|e| eyre!("RPC transport failure for {}: {}", method, e))?
      .error_for_status()
      .map_err(|e| eyre!("RPC HTTP error for {}: {}", method, e))?;

    let envelope: RpcEnvelope = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to decode RPC response for {}: {}", method, e))?;

    if let Some(error) = envelope.error {
      return Err(eyre!("RPC error for {}: {}", method, error));
    }

    Ok(envelope.result)
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::{Method, RemoteClient, RemoteError, RemoteResponse, RequestOptions};
use crate::config::{Config, RemoteConfig};

/// Supplies the bearer token for API calls. Acquiring it is the host's job.
#[async_trait]
pub trait TokenProvider: Send + Sync {
  async fn token(&self) -> Option<String>;
}

/// Reads the token from CARELINE_API_TOKEN on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvTokenProvider;

#[async_trait]
impl TokenProvider for EnvTokenProvider {
  async fn token(&self) -> Option<String> {
    Config::get_api_token().ok()
  }
}

/// Care API client over HTTPS.
#[derive(Clone)]
pub struct HttpRemoteClient {
  client: reqwest::Client,
  base_url: Url,
  tokens: Arc<dyn TokenProvider>,
}

impl HttpRemoteClient {
  pub fn new(config: &RemoteConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
    let mut base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;

    // Url::join replaces the last segment unless the base ends with a slash
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      tokens,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| RemoteError::Network(format!("invalid path {}: {}", path, e)))
  }
}

fn to_reqwest(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
  if err.is_timeout() {
    RemoteError::Timeout
  } else {
    RemoteError::Network(err.to_string())
  }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    options: RequestOptions,
  ) -> Result<RemoteResponse, RemoteError> {
    let url = self.endpoint(path)?;
    debug!(?method, %url, "remote request");

    let mut request = self
      .client
      .request(to_reqwest(method), url)
      .timeout(options.timeout);
    if let Some(token) = self.tokens.token().await {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(classify_transport)?;

    let data = if bytes.is_empty() {
      None
    } else {
      match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => Some(value),
        Err(e) if (200..300).contains(&status) => {
          return Err(RemoteError::Decode(e.to_string()));
        }
        // Error pages are not always JSON; the status alone classifies them
        Err(_) => None,
      }
    };

    if let Some(error) = RemoteError::from_status(status, data.as_ref()) {
      debug!(status, %error, "remote request rejected");
      return Err(error);
    }

    Ok(RemoteResponse { status, data })
  }
}

//! HTTP transport towards agents.
//!
//! The agent exposes a small JSON API. Unary calls return a single JSON
//! document; streaming calls return newline-delimited JSON which is split
//! into values as bytes arrive.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::AgentError;

/// Buffered values of a streaming response.
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Network location of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: i64,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: i64) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Carries requests to agents.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Send a request and wait for one JSON response.
    async fn post(&self, endpoint: &Endpoint, path: &str, body: Value)
    -> Result<Value, AgentError>;

    /// Send a request and receive a stream of JSON values.
    async fn post_stream(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Value,
    ) -> Result<mpsc::Receiver<Result<Value, AgentError>>, AgentError>;
}

/// `reqwest`-based transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    scheme: &'static str,
}

impl HttpTransport {
    pub fn new(use_tls: bool, connect_timeout: Duration) -> Result<Self, AgentError> {
        // reqwest is built with rustls-no-provider; an Err means a provider
        // is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AgentError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            scheme: if use_tls { "https" } else { "http" },
        })
    }

    fn url(&self, endpoint: &Endpoint, path: &str) -> String {
        format!("{}://{endpoint}{path}", self.scheme)
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Response, AgentError> {
        let resp = self
            .http
            .post(self.url(endpoint, path))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::Protocol(format!(
                "agent at {endpoint} answered HTTP {}",
                status.as_u16()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    async fn post(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Value,
    ) -> Result<Value, AgentError> {
        let resp = self.send(endpoint, path, &body).await?;
        resp.json::<Value>()
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))
    }

    async fn post_stream(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Value,
    ) -> Result<mpsc::Receiver<Result<Value, AgentError>>, AgentError> {
        let mut resp = self.send(endpoint, path, &body).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let endpoint = endpoint.clone();

        tokio::spawn(async move {
            let mut splitter = LineSplitter::default();
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        for value in splitter.push(&chunk) {
                            if tx.send(value).await.is_err() {
                                debug!(%endpoint, "Stream receiver dropped");
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(value) = splitter.finish() {
                            let _ = tx.send(value).await;
                        }
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(AgentError::from(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Splits newline-delimited JSON arriving in arbitrary chunks.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Append bytes and return the complete lines parsed so far.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<Result<Value, AgentError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(value) = parse_line(&line) {
                out.push(value);
            }
        }
        out
    }

    /// Parse whatever is left after the stream closed.
    pub(crate) fn finish(&mut self) -> Option<Result<Value, AgentError>> {
        let rest = std::mem::take(&mut self.buf);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<Result<Value, AgentError>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_slice(trimmed).map_err(|e| AgentError::Protocol(e.to_string())))
}

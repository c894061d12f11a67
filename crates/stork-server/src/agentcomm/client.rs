//! Agent RPC client with per-call timeouts and error counters.
//!
//! Every call is bounded by the configured timeout and by a cancellation
//! token. Failures are classified and counted per agent and per daemon;
//! a successful call resets the matching counter. Nothing is retried here.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::AgentError;
use super::transport::{AgentTransport, Endpoint};
use crate::dhcp::{KeaCommand, KeaResponse};
use crate::storage::{AccessPoint, AppType, AppUpdate, DaemonTarget, DaemonUpdate, MachineState, ZoneRecord};

pub const STATE_PATH: &str = "/api/v1/state";
pub const KEA_PATH: &str = "/api/v1/kea";
pub const BIND9_STATS_PATH: &str = "/api/v1/bind9/stats";
pub const BIND9_ZONES_PATH: &str = "/api/v1/bind9/zones";

/// Error counters of one daemon behind an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonErrorStats {
    /// Errors reported by the Kea control agent when forwarding.
    pub ca_errors: u64,
    /// Errors reported by the daemon itself.
    pub daemon_errors: u64,
}

/// Error counters of one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub conn_errors: u64,
    pub per_daemon: BTreeMap<String, DaemonErrorStats>,
}

/// Machine state and discovered apps as reported by an agent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(flatten)]
    pub machine: MachineState,
    #[serde(default)]
    pub apps: Vec<AgentApp>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentApp {
    #[serde(rename = "type")]
    pub app_type: AppType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub access_points: Vec<AccessPoint>,
    #[serde(default)]
    pub daemons: Vec<DaemonUpdate>,
}

impl AgentApp {
    /// Convert into an app update for the given machine. Apps reported
    /// without a name are named after their type and the machine address.
    pub fn into_update(self, machine_id: i64, machine_address: &str) -> AppUpdate {
        let name = if self.name.is_empty() {
            format!("{}@{machine_address}", self.app_type.as_str())
        } else {
            self.name
        };
        let active = self.daemons.iter().any(|d| d.active);
        AppUpdate {
            machine_id,
            app_type: self.app_type,
            name,
            active,
            version: self.version,
            access_points: self
                .access_points
                .into_iter()
                .map(|ap| AccessPoint { machine_id, ..ap })
                .collect(),
            daemons: self.daemons,
        }
    }
}

/// Envelope returned by the agent for forwarded Kea commands.
#[derive(Debug, Deserialize)]
struct KeaEnvelope {
    status: EnvelopeStatus,
    #[serde(default)]
    response: Value,
}

#[derive(Debug, Deserialize)]
struct EnvelopeStatus {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Stream of zone records from one agent.
pub struct ZoneStream {
    rx: mpsc::Receiver<Result<Value, AgentError>>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl ZoneStream {
    /// Next zone, `None` once the agent closed the stream.
    pub async fn next(&mut self) -> Option<Result<ZoneRecord, AgentError>> {
        let item = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Some(Err(AgentError::Cancelled)),
            item = tokio::time::timeout(self.timeout, self.rx.recv()) => item,
        };
        match item {
            Err(_) => Some(Err(AgentError::Timeout(self.timeout.as_secs()))),
            Ok(None) => None,
            Ok(Some(Err(e))) => Some(Err(e)),
            Ok(Some(Ok(value))) => Some(
                serde_json::from_value(value).map_err(|e| AgentError::Protocol(e.to_string())),
            ),
        }
    }
}

/// Client used by every component that talks to agents.
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    timeout: Duration,
    stats: RwLock<HashMap<Endpoint, AgentStats>>,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Error counters of the agent at `address:port`.
    pub async fn stats(&self, address: &str, port: i64) -> AgentStats {
        self.stats
            .read()
            .await
            .get(&Endpoint::new(address, port))
            .cloned()
            .unwrap_or_default()
    }

    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, AgentError>> + Send,
    ) -> Result<T, AgentError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => {
                res.unwrap_or_else(|_| Err(AgentError::Timeout(self.timeout.as_secs())))
            }
        }
    }

    /// Update the agent's connection counter from a call outcome.
    async fn record_transport<T>(
        &self,
        endpoint: &Endpoint,
        result: Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(endpoint.clone()).or_default();
        match &result {
            Ok(_) => entry.conn_errors = 0,
            Err(e) if e.is_communication() => {
                entry.conn_errors += 1;
                warn!(%endpoint, error = %e, errors = entry.conn_errors, "Agent communication failed");
            }
            Err(_) => {}
        }
        result
    }

    /// Fetch machine state and discovered apps.
    pub async fn get_state(
        &self,
        address: &str,
        port: i64,
        cancel: &CancellationToken,
    ) -> Result<AgentState, AgentError> {
        let endpoint = Endpoint::new(address, port);
        let result = self
            .guarded(cancel, self.transport.post(&endpoint, STATE_PATH, json!({})))
            .await
            .and_then(|v| {
                serde_json::from_value::<AgentState>(v)
                    .map_err(|e| AgentError::Protocol(e.to_string()))
            });
        self.record_transport(&endpoint, result).await
    }

    /// Forward a command to Kea daemons and return one response per daemon.
    pub async fn call_kea(
        &self,
        target: &DaemonTarget,
        command: &KeaCommand,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeaResponse>, AgentError> {
        let endpoint = Endpoint::new(&target.machine_address, target.agent_port);
        let control_url = control_url(target)?;
        let body = json!({"controlUrl": control_url, "command": command});
        debug!(%endpoint, command = %command.command, daemons = ?command.service, "Sending Kea command");

        let result = self
            .guarded(cancel, self.transport.post(&endpoint, KEA_PATH, body))
            .await
            .and_then(|v| {
                serde_json::from_value::<KeaEnvelope>(v)
                    .map_err(|e| AgentError::Protocol(e.to_string()))
            });
        let envelope = self.record_transport(&endpoint, result).await?;

        let mut stats = self.stats.write().await;
        let agent = stats.entry(endpoint.clone()).or_default();
        if envelope.status.code != 0 {
            for daemon in &command.service {
                agent.per_daemon.entry(daemon.clone()).or_default().ca_errors += 1;
            }
            warn!(%endpoint, code = envelope.status.code, message = %envelope.status.message, "Kea control agent error");
            return Err(AgentError::Daemon {
                code: envelope.status.code,
                text: envelope.status.message,
            });
        }

        let responses: Vec<KeaResponse> = match envelope.response {
            Value::Array(_) => serde_json::from_value(envelope.response),
            Value::Null => Ok(Vec::new()),
            other => serde_json::from_value(other).map(|r| vec![r]),
        }
        .map_err(|e| AgentError::Protocol(e.to_string()))?;

        for (i, daemon) in command.service.iter().enumerate() {
            let counters = agent.per_daemon.entry(daemon.clone()).or_default();
            counters.ca_errors = 0;
            match responses.get(i) {
                Some(r) if !r.is_ok() => counters.daemon_errors += 1,
                Some(_) => counters.daemon_errors = 0,
                None => {}
            }
        }
        Ok(responses)
    }

    /// Forward a command to a single daemon. A non-success result is an
    /// error carrying the daemon's code and text.
    pub async fn call_kea_daemon(
        &self,
        target: &DaemonTarget,
        command: &KeaCommand,
        cancel: &CancellationToken,
    ) -> Result<KeaResponse, AgentError> {
        let response = self
            .call_kea(target, command, cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Protocol(format!("empty response to {}", command.command)))?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(AgentError::Daemon {
                code: response.result,
                text: response.text_or_default().to_string(),
            })
        }
    }

    /// Fetch BIND 9 statistics through the daemon's statistics channel.
    pub async fn bind9_stats(
        &self,
        target: &DaemonTarget,
        cancel: &CancellationToken,
    ) -> Result<Value, AgentError> {
        let endpoint = Endpoint::new(&target.machine_address, target.agent_port);
        let (Some(address), Some(port)) = (&target.statistics_address, target.statistics_port)
        else {
            return Err(AgentError::Protocol(format!(
                "daemon {} has no statistics channel",
                target.daemon_id
            )));
        };
        let body = json!({"statsAddress": address, "statsPort": port});
        let result = self
            .guarded(cancel, self.transport.post(&endpoint, BIND9_STATS_PATH, body))
            .await;
        self.record_transport(&endpoint, result).await
    }

    /// Open the zone inventory stream of a BIND 9 daemon.
    pub async fn receive_zones(
        &self,
        target: &DaemonTarget,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ZoneStream, AgentError> {
        let endpoint = Endpoint::new(&target.machine_address, target.agent_port);
        let body = json!({
            "controlAddress": target.control_address,
            "controlPort": target.control_port,
            "force": force,
        });
        let result = self
            .guarded(cancel, self.transport.post_stream(&endpoint, BIND9_ZONES_PATH, body))
            .await;
        let rx = self.record_transport(&endpoint, result).await?;
        Ok(ZoneStream {
            rx,
            cancel: cancel.clone(),
            timeout: self.timeout,
        })
    }
}

fn control_url(target: &DaemonTarget) -> Result<String, AgentError> {
    let (Some(address), Some(port)) = (&target.control_address, target.control_port) else {
        return Err(AgentError::Protocol(format!(
            "app {} has no control access point",
            target.app_id
        )));
    };
    let scheme = if target.control_use_tls.unwrap_or(false) {
        "https"
    } else {
        "http"
    };
    Ok(format!("{scheme}://{}/", Endpoint::new(address.as_str(), port)))
}

//! Scripted in-process agent transport for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};

use super::client::{BIND9_STATS_PATH, BIND9_ZONES_PATH, KEA_PATH, STATE_PATH};
use super::error::AgentError;
use super::transport::{AgentTransport, Endpoint};

/// A Kea command as received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub endpoint: Endpoint,
    pub daemon: String,
    pub command: String,
    pub arguments: Option<Value>,
}

/// Answers agent requests from canned data and records Kea commands.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentCommand>>,
    kea_results: Mutex<HashMap<String, (i64, String)>>,
    kea_arguments: Mutex<HashMap<String, Value>>,
    states: Mutex<HashMap<Endpoint, Value>>,
    bind9_stats: Mutex<HashMap<Endpoint, Value>>,
    zones: Mutex<HashMap<Endpoint, Vec<Value>>>,
    unreachable: Mutex<HashSet<Endpoint>>,
    zones_gate: Mutex<Option<Arc<Semaphore>>>,
    zone_requests: Mutex<Vec<Value>>,
    next_subnet_id: AtomicI64,
}

#[allow(clippy::unwrap_used)]
impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_subnet_id: AtomicI64::new(100),
            ..Self::default()
        })
    }

    /// Make every `command` answer with `result` and `text`.
    pub fn fail_command(&self, command: &str, result: i64, text: &str) {
        self.kea_results
            .lock()
            .unwrap()
            .insert(command.to_string(), (result, text.to_string()));
    }

    /// Arguments returned for `command`.
    pub fn set_arguments(&self, command: &str, arguments: Value) {
        self.kea_arguments
            .lock()
            .unwrap()
            .insert(command.to_string(), arguments);
    }

    pub fn set_state(&self, endpoint: Endpoint, state: Value) {
        self.states.lock().unwrap().insert(endpoint, state);
    }

    pub fn set_bind9_stats(&self, endpoint: Endpoint, stats: Value) {
        self.bind9_stats.lock().unwrap().insert(endpoint, stats);
    }

    pub fn set_zones(&self, endpoint: Endpoint, zones: Vec<Value>) {
        self.zones.lock().unwrap().insert(endpoint, zones);
    }

    pub fn set_unreachable(&self, endpoint: Endpoint) {
        self.unreachable.lock().unwrap().insert(endpoint);
    }

    /// Hold every zone stream until a permit is added to the returned gate.
    pub fn gate_zones(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.zones_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Bodies of the zone inventory requests received so far.
    pub fn zone_requests(&self) -> Vec<Value> {
        self.zone_requests.lock().unwrap().clone()
    }

    /// Kea commands received so far, in order.
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    /// Names of the Kea commands received so far, in order.
    pub fn sent_names(&self) -> Vec<String> {
        self.sent().into_iter().map(|c| c.command).collect()
    }

    fn check_reachable(&self, endpoint: &Endpoint) -> Result<(), AgentError> {
        if self.unreachable.lock().unwrap().contains(endpoint) {
            Err(AgentError::Connect(format!("connection refused by {endpoint}")))
        } else {
            Ok(())
        }
    }

    fn answer_kea(&self, endpoint: &Endpoint, body: &Value) -> Value {
        let command = body["command"]["command"].as_str().unwrap_or_default().to_string();
        let arguments = body["command"].get("arguments").cloned();
        let daemons: Vec<String> = body["command"]["service"]
            .as_array()
            .map(|s| s.iter().filter_map(Value::as_str).map(ToString::to_string).collect())
            .unwrap_or_default();

        let mut responses = Vec::new();
        for daemon in daemons {
            self.sent.lock().unwrap().push(SentCommand {
                endpoint: endpoint.clone(),
                daemon,
                command: command.clone(),
                arguments: arguments.clone(),
            });
            if let Some((result, text)) = self.kea_results.lock().unwrap().get(&command) {
                responses.push(json!({"result": result, "text": text}));
                continue;
            }
            let args = if let Some(args) = self.kea_arguments.lock().unwrap().get(&command) {
                Some(args.clone())
            } else if command.ends_with("-add") && command.starts_with("subnet") {
                let id = self.next_subnet_id.fetch_add(1, Ordering::SeqCst);
                Some(json!({"subnets": [{"id": id}]}))
            } else {
                None
            };
            responses.push(json!({"result": 0, "text": "ok", "arguments": args}));
        }
        json!({"status": {"code": 0, "message": ""}, "response": responses})
    }
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl AgentTransport for MockTransport {
    async fn post(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Value,
    ) -> Result<Value, AgentError> {
        self.check_reachable(endpoint)?;
        match path {
            KEA_PATH => Ok(self.answer_kea(endpoint, &body)),
            STATE_PATH => self
                .states
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .ok_or_else(|| AgentError::Connect(format!("no agent at {endpoint}"))),
            BIND9_STATS_PATH => Ok(self
                .bind9_stats
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .unwrap_or_else(|| json!({}))),
            other => Err(AgentError::Protocol(format!("unexpected path {other}"))),
        }
    }

    async fn post_stream(
        &self,
        endpoint: &Endpoint,
        path: &str,
        body: Value,
    ) -> Result<mpsc::Receiver<Result<Value, AgentError>>, AgentError> {
        self.check_reachable(endpoint)?;
        if path != BIND9_ZONES_PATH {
            return Err(AgentError::Protocol(format!("unexpected path {path}")));
        }
        self.zone_requests.lock().unwrap().push(body);
        let zones = self
            .zones
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_default();
        let gate = self.zones_gate.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            for zone in zones {
                if tx.send(Ok(zone)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

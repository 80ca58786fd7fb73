// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: typed events and the seal/open boundary.
//!
//! Every inter-node message is a named event with a JSON payload. On a
//! security-enabled node the payload is wrapped in a
//! [`SecurityEnvelope`](crate::envelope::SecurityEnvelope) before it
//! reaches the transport and unwrapped before dispatch.
//!
//! # Events
//!
//! | Event | Payload |
//! |---|---|
//! | `put` | [`PutMessage`] |
//! | `vector-clock-sync` | [`ClockSync`] |
//! | `vector-clock-sync-response` | [`ClockSyncResponse`] |
//! | `anti-entropy-request` | [`AntiEntropyRequest`] |
//! | `anti-entropy-response` | [`AntiEntropyResponse`] |
//! | `security-handshake` | [`SecurityHandshake`] |
//! | `security-handshake-response` | [`SecurityHandshakeResponse`] |
//! | `identify` | [`Identify`] |
//!
//! `timestamp` fields are observability only; causality is carried by
//! vector clocks.

use crate::envelope::{EnvelopeBlob, Payload, SecurityEnvelope};
use crate::error::{ReplicationError, Result};
use crate::transport::{Frame, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Milliseconds since the epoch, for observability fields.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A replicated write, local or forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutMessage {
    pub path: String,
    pub value: Value,
    /// Random 128-bit id; the authoritative dedupe key.
    pub msg_id: String,
    /// Node that authored the value.
    pub origin: String,
    /// Author-side clock; loosely typed so a malformed peer clock is
    /// sanitized rather than rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<Value>,
    /// Best-effort loop prevention; `msg_id` is authoritative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visited_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded: Option<bool>,
    /// Set on writes re-ingested from reconciliation; suppresses
    /// re-broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_entropy: Option<bool>,
}

impl PutMessage {
    /// True when this write came from an anti-entropy pull.
    pub fn is_anti_entropy(&self) -> bool {
        self.anti_entropy.unwrap_or(false)
    }

    /// The visited-servers list, empty when absent.
    pub fn visited(&self) -> &[String] {
        self.visited_servers.as_deref().unwrap_or(&[])
    }
}

/// Vector-clock exchange request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSync {
    #[serde(rename = "type")]
    pub kind: String,
    pub vector_clock: Value,
    pub node_id: String,
    pub timestamp: i64,
    pub sync_id: String,
    pub is_anti_entropy: bool,
}

impl ClockSync {
    pub fn new(vector_clock: Value, node_id: &str, sync_id: &str) -> Self {
        Self {
            kind: "vector-clock-sync".to_string(),
            vector_clock,
            node_id: node_id.to_string(),
            timestamp: now_millis(),
            sync_id: sync_id.to_string(),
            is_anti_entropy: true,
        }
    }
}

/// Vector-clock exchange response, carrying the responder's merged clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSyncResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub vector_clock: Value,
    pub node_id: String,
    pub timestamp: i64,
    pub in_response_to: String,
    pub is_anti_entropy: bool,
}

impl ClockSyncResponse {
    pub fn new(vector_clock: Value, node_id: &str, in_response_to: &str) -> Self {
        Self {
            kind: "vector-clock-sync-response".to_string(),
            vector_clock,
            node_id: node_id.to_string(),
            timestamp: now_millis(),
            in_response_to: in_response_to.to_string(),
            is_anti_entropy: true,
        }
    }
}

/// Pull request: "send me everything under `path`".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiEntropyRequest {
    pub request_id: String,
    pub node_id: String,
    pub vector_clock: Value,
    pub timestamp: i64,
    /// Path prefix; empty means everything.
    #[serde(default)]
    pub path: String,
    pub is_anti_entropy: bool,
}

/// One record inside an anti-entropy response batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub path: String,
    pub value: Value,
    pub vector_clock: Value,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One batch of records answering an [`AntiEntropyRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiEntropyResponse {
    pub response_id: String,
    pub node_id: String,
    pub vector_clock: Value,
    pub timestamp: i64,
    pub batch_index: usize,
    pub total_batches: usize,
    pub changes: Vec<ChangeRecord>,
    pub is_anti_entropy: bool,
}

/// Encrypted challenge proving the peer holds the same master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityHandshake {
    pub challenge: Value,
}

/// Handshake answer: the decrypted challenge plus a MAC over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityHandshakeResponse {
    pub success: bool,
    #[serde(rename = "serverID", default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_challenge: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub security_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// First message on a new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    #[serde(rename = "serverID")]
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// All wire events.
#[derive(Debug, Clone)]
pub enum Event {
    Put(PutMessage),
    VectorClockSync(ClockSync),
    VectorClockSyncResponse(ClockSyncResponse),
    AntiEntropyRequest(AntiEntropyRequest),
    AntiEntropyResponse(AntiEntropyResponse),
    SecurityHandshake(SecurityHandshake),
    SecurityHandshakeResponse(SecurityHandshakeResponse),
    Identify(Identify),
}

impl Event {
    /// The wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Put(_) => "put",
            Event::VectorClockSync(_) => "vector-clock-sync",
            Event::VectorClockSyncResponse(_) => "vector-clock-sync-response",
            Event::AntiEntropyRequest(_) => "anti-entropy-request",
            Event::AntiEntropyResponse(_) => "anti-entropy-response",
            Event::SecurityHandshake(_) => "security-handshake",
            Event::SecurityHandshakeResponse(_) => "security-handshake-response",
            Event::Identify(_) => "identify",
        }
    }

    /// True for frames that belong to reconciliation and are exempt from
    /// inbound rate limiting.
    pub fn is_anti_entropy(&self) -> bool {
        match self {
            Event::Put(m) => m.is_anti_entropy(),
            Event::VectorClockSync(m) => m.is_anti_entropy,
            Event::VectorClockSyncResponse(m) => m.is_anti_entropy,
            Event::AntiEntropyRequest(m) => m.is_anti_entropy,
            Event::AntiEntropyResponse(m) => m.is_anti_entropy,
            _ => false,
        }
    }

    /// Serialize the payload (without the envelope).
    pub fn to_payload(&self) -> Result<Value> {
        let value = match self {
            Event::Put(m) => serde_json::to_value(m),
            Event::VectorClockSync(m) => serde_json::to_value(m),
            Event::VectorClockSyncResponse(m) => serde_json::to_value(m),
            Event::AntiEntropyRequest(m) => serde_json::to_value(m),
            Event::AntiEntropyResponse(m) => serde_json::to_value(m),
            Event::SecurityHandshake(m) => serde_json::to_value(m),
            Event::SecurityHandshakeResponse(m) => serde_json::to_value(m),
            Event::Identify(m) => serde_json::to_value(m),
        }?;
        Ok(value)
    }

    /// Parse a payload for a named event. Unknown names and malformed
    /// payloads are protocol errors.
    pub fn parse(event: &str, payload: Value) -> Result<Event> {
        let parsed = match event {
            "put" => Event::Put(serde_json::from_value(payload)?),
            "vector-clock-sync" => Event::VectorClockSync(serde_json::from_value(payload)?),
            "vector-clock-sync-response" => {
                Event::VectorClockSyncResponse(serde_json::from_value(payload)?)
            }
            "anti-entropy-request" => {
                Event::AntiEntropyRequest(serde_json::from_value(payload)?)
            }
            "anti-entropy-response" => {
                Event::AntiEntropyResponse(serde_json::from_value(payload)?)
            }
            "security-handshake" => Event::SecurityHandshake(serde_json::from_value(payload)?),
            "security-handshake-response" => {
                Event::SecurityHandshakeResponse(serde_json::from_value(payload)?)
            }
            "identify" => Event::Identify(serde_json::from_value(payload)?),
            other => {
                return Err(ReplicationError::Protocol(format!(
                    "unknown event '{}'",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

/// The seal/open layer between typed events and the transport.
///
/// When the node is security-enabled, every outbound payload is encrypted
/// and every inbound payload must arrive encrypted; plaintext frames on a
/// secured mesh are dropped (conservative default). The reverse mismatch -
/// an encrypted frame on a plaintext node - is also dropped with a warning.
pub struct Wire {
    node_id: String,
    transport: Arc<dyn Transport>,
    envelope: Option<Arc<SecurityEnvelope>>,
}

impl Wire {
    pub fn new(
        node_id: &str,
        transport: Arc<dyn Transport>,
        envelope: Option<Arc<SecurityEnvelope>>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            transport,
            envelope,
        }
    }

    /// Whether outbound payloads are encrypted.
    pub fn security_enabled(&self) -> bool {
        self.envelope.is_some()
    }

    /// The envelope, for handshake MAC operations.
    pub fn envelope(&self) -> Option<&Arc<SecurityEnvelope>> {
        self.envelope.as_ref()
    }

    /// Peers currently reachable.
    pub fn peers(&self) -> Vec<String> {
        self.transport.peers()
    }

    fn seal(&self, event: &Event) -> Result<Value> {
        let payload = event.to_payload()?;
        let blob = match &self.envelope {
            Some(envelope) => envelope.encrypt(&Payload::Json(payload))?,
            None => EnvelopeBlob::plain(payload),
        };
        Ok(serde_json::to_value(blob)?)
    }

    /// Seal and send an event to one peer.
    pub async fn send(&self, peer_id: &str, event: &Event) -> Result<()> {
        let frame = Frame {
            from: self.node_id.clone(),
            event: event.name().to_string(),
            payload: self.seal(event)?,
        };
        self.transport.emit(peer_id, frame).await
    }

    /// Seal and broadcast an event to every peer.
    pub async fn broadcast(&self, event: &Event) -> Result<()> {
        let frame = Frame {
            from: self.node_id.clone(),
            event: event.name().to_string(),
            payload: self.seal(event)?,
        };
        self.transport.broadcast(frame).await
    }

    /// Unwrap and parse an inbound frame.
    pub fn open(&self, frame: &Frame) -> Result<Event> {
        let blob: EnvelopeBlob = serde_json::from_value(frame.payload.clone())
            .map_err(|e| ReplicationError::Protocol(format!("bad envelope: {}", e)))?;

        let payload = match (&self.envelope, blob.encrypted) {
            (Some(envelope), true) => match envelope.decrypt(&blob)? {
                Payload::Json(value) => value,
                _ => {
                    return Err(ReplicationError::Protocol(
                        "non-JSON payload in event envelope".into(),
                    ))
                }
            },
            (Some(_), false) => {
                warn!(from = %frame.from, event = %frame.event, "Dropping plaintext frame on secured mesh");
                return Err(ReplicationError::Protocol(
                    "unencrypted message on secured mesh".into(),
                ));
            }
            (None, true) => {
                warn!(from = %frame.from, event = %frame.event, "Dropping encrypted frame; security disabled locally");
                return Err(ReplicationError::Decrypt(
                    "encrypted message but security disabled".into(),
                ));
            }
            (None, false) => blob.data.unwrap_or(Value::Null),
        };

        Event::parse(&frame.event, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::transport::MeshNetwork;
    use serde_json::json;

    fn envelope(key: &str) -> Arc<SecurityEnvelope> {
        let config = SecurityConfig {
            kdf_iterations: 1000,
            ..SecurityConfig::with_master_key(key)
        };
        Arc::new(SecurityEnvelope::new(&config).unwrap())
    }

    fn put_message() -> PutMessage {
        PutMessage {
            path: "a/b".into(),
            value: json!({"n": 1}),
            msg_id: "m1".into(),
            origin: "n1".into(),
            vector_clock: Some(json!({"n1": 1})),
            visited_servers: Some(vec!["n1".into()]),
            hop_count: None,
            forwarded: None,
            anti_entropy: None,
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::Put(put_message()).name(), "put");
        assert_eq!(
            Event::VectorClockSync(ClockSync::new(json!({}), "n1", "s1")).name(),
            "vector-clock-sync"
        );
    }

    #[test]
    fn test_put_serde_camel_case() {
        let v = serde_json::to_value(put_message()).unwrap();
        assert_eq!(v["msgId"], json!("m1"));
        assert_eq!(v["vectorClock"], json!({"n1": 1}));
        assert_eq!(v["visitedServers"], json!(["n1"]));
        assert!(v.get("antiEntropy").is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_event() {
        let err = Event::parse("rm-rf", json!({})).unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_put() {
        let err = Event::parse("put", json!({"path": "a"})).unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
    }

    #[test]
    fn test_is_anti_entropy() {
        let mut m = put_message();
        assert!(!Event::Put(m.clone()).is_anti_entropy());
        m.anti_entropy = Some(true);
        assert!(Event::Put(m).is_anti_entropy());
        assert!(Event::VectorClockSync(ClockSync::new(json!({}), "n", "s")).is_anti_entropy());
        assert!(!Event::Identify(Identify {
            server_id: "n".into(),
            url: None
        })
        .is_anti_entropy());
    }

    #[tokio::test]
    async fn test_wire_roundtrip_plaintext() {
        let net = MeshNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut b_rx = b.take_inbound().unwrap();

        let wire_a = Wire::new("a", a, None);
        let wire_b = Wire::new("b", b, None);

        wire_a.send("b", &Event::Put(put_message())).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        let event = wire_b.open(&frame).unwrap();
        match event {
            Event::Put(m) => assert_eq!(m.path, "a/b"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wire_roundtrip_encrypted() {
        let net = MeshNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut b_rx = b.take_inbound().unwrap();

        let wire_a = Wire::new("a", a, Some(envelope("shared-mesh-master-key")));
        let wire_b = Wire::new("b", b, Some(envelope("shared-mesh-master-key")));

        wire_a.send("b", &Event::Put(put_message())).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        assert_eq!(frame.payload["encrypted"], json!(true));
        let event = wire_b.open(&frame).unwrap();
        assert!(matches!(event, Event::Put(_)));
    }

    #[tokio::test]
    async fn test_wire_wrong_key_fails_to_open() {
        let net = MeshNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut b_rx = b.take_inbound().unwrap();

        let wire_a = Wire::new("a", a, Some(envelope("first-cluster-key-000")));
        let wire_b = Wire::new("b", b, Some(envelope("second-cluster-key-00")));

        wire_a.send("b", &Event::Put(put_message())).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        let err = wire_b.open(&frame).unwrap_err();
        assert!(matches!(err, ReplicationError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_wire_drops_plaintext_on_secured_mesh() {
        let net = MeshNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut b_rx = b.take_inbound().unwrap();

        let wire_a = Wire::new("a", a, None);
        let wire_b = Wire::new("b", b, Some(envelope("shared-mesh-master-key")));

        wire_a.send("b", &Event::Put(put_message())).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        assert!(wire_b.open(&frame).is_err());
    }

    #[tokio::test]
    async fn test_wire_drops_encrypted_when_disabled() {
        let net = MeshNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let mut b_rx = b.take_inbound().unwrap();

        let wire_a = Wire::new("a", a, Some(envelope("shared-mesh-master-key")));
        let wire_b = Wire::new("b", b, None);

        wire_a.send("b", &Event::Put(put_message())).await.unwrap();
        let frame = b_rx.recv().await.unwrap();
        let err = wire_b.open(&frame).unwrap_err();
        assert!(matches!(err, ReplicationError::Decrypt(_)));
    }

    #[test]
    fn test_handshake_response_serde() {
        let response = SecurityHandshakeResponse {
            success: true,
            server_id: Some("n2".into()),
            timestamp: Some(123),
            original_challenge: Some(json!("abc")),
            mac: Some("cafe".into()),
            security_enabled: true,
            message: None,
        };
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["serverID"], json!("n2"));
        assert_eq!(v["securityEnabled"], json!(true));
        let back: SecurityHandshakeResponse = serde_json::from_value(v).unwrap();
        assert_eq!(back.server_id.as_deref(), Some("n2"));
    }
}

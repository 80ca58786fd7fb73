// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound frame dispatch.
//!
//! Every inbound transport frame is opened (envelope verified), parsed,
//! and handled as an independent task. Handler failures are logged and
//! dropped; no peer message can crash the node. Inbound `put` traffic
//! passes the rate limiter unless it carries the anti-entropy marker.

use crate::anti_entropy::Reconciler;
use crate::envelope::Payload;
use crate::error::{ReplicationError, Result};
use crate::node::SharedState;
use crate::resilience::RateLimiter;
use crate::wire::{now_millis, Event, SecurityHandshake, SecurityHandshakeResponse, Wire};
use crate::writer::WriteProcessor;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

/// Handles shared by every dispatched frame task.
pub(crate) struct DispatchCtx {
    pub node_id: String,
    pub wire: Arc<Wire>,
    pub writer: Arc<WriteProcessor>,
    pub reconciler: Arc<Reconciler>,
    pub state: Arc<Mutex<SharedState>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub shutting_down: Arc<AtomicBool>,
}

/// Drain the transport's inbound channel until shutdown.
pub(crate) async fn run(
    ctx: Arc<DispatchCtx>,
    mut inbound: mpsc::Receiver<crate::transport::Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let _ = shutdown_rx.borrow_and_update();
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Dispatch loop stopping");
                    break;
                }
            }

            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    debug!("Transport inbound closed");
                    break;
                };
                if ctx.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                // Each frame is an independent task; the shared-state lock
                // serializes what must be serialized.
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_frame(&ctx, frame).await {
                        match &e {
                            ReplicationError::Decrypt(_) => {
                                crate::metrics::record_decrypt_failure("unknown");
                                warn!(error = %e, "Dropped undecryptable frame");
                            }
                            ReplicationError::Shutdown => {}
                            _ => {
                                crate::metrics::record_frame_dropped("handler-error");
                                warn!(error = %e, "Dropped inbound frame");
                            }
                        }
                    }
                });
            }
        }
    }
}

async fn handle_frame(ctx: &DispatchCtx, frame: crate::transport::Frame) -> Result<()> {
    let event = match ctx.wire.open(&frame) {
        Ok(event) => event,
        Err(ReplicationError::Decrypt(reason)) => {
            crate::metrics::record_decrypt_failure(&frame.from);
            warn!(from = %frame.from, event = %frame.event, %reason, "Dropping undecryptable frame");
            return Ok(());
        }
        Err(e) => {
            crate::metrics::record_frame_dropped("protocol");
            warn!(from = %frame.from, event = %frame.event, error = %e, "Dropping malformed frame");
            return Ok(());
        }
    };

    if let Some(limiter) = &ctx.rate_limiter {
        if !event.is_anti_entropy() {
            limiter.acquire().await;
        }
    }

    trace!(from = %frame.from, event = event.name(), "Dispatching frame");
    match event {
        Event::Put(msg) => {
            ctx.writer.handle_put(msg).await?;
        }
        Event::VectorClockSync(sync) => {
            ctx.reconciler.handle_clock_sync(&frame.from, sync).await?;
        }
        Event::VectorClockSyncResponse(response) => {
            ctx.reconciler.handle_clock_sync_response(response).await?;
        }
        Event::AntiEntropyRequest(request) => {
            ctx.reconciler.handle_request(&frame.from, request).await?;
        }
        Event::AntiEntropyResponse(response) => {
            ctx.reconciler.handle_response(&frame.from, response).await?;
        }
        Event::SecurityHandshake(handshake) => {
            handle_handshake(ctx, &frame.from, handshake).await?;
        }
        Event::SecurityHandshakeResponse(response) => {
            handle_handshake_response(ctx, &frame.from, response).await?;
        }
        Event::Identify(identify) => {
            let mut state = ctx.state.lock().await;
            state.known_nodes.insert(identify.server_id.clone());
            state.clock.ensure(&identify.server_id);
            debug!(peer_id = %identify.server_id, url = ?identify.url, "Peer identified");
        }
    }
    Ok(())
}

/// Answer a handshake: decrypt the challenge and echo it with a MAC.
async fn handle_handshake(
    ctx: &DispatchCtx,
    from: &str,
    handshake: SecurityHandshake,
) -> Result<()> {
    let Some(envelope) = ctx.wire.envelope() else {
        let response = SecurityHandshakeResponse {
            success: false,
            server_id: Some(ctx.node_id.clone()),
            timestamp: Some(now_millis()),
            original_challenge: None,
            mac: None,
            security_enabled: false,
            message: Some("security disabled on this node".into()),
        };
        return ctx
            .wire
            .send(from, &Event::SecurityHandshakeResponse(response))
            .await;
    };

    let blob = serde_json::from_value(handshake.challenge)
        .map_err(|e| ReplicationError::Protocol(format!("bad challenge envelope: {}", e)))?;
    let challenge = match envelope.decrypt(&blob)? {
        Payload::Json(value) => value
            .get("challenge")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReplicationError::Protocol("challenge field missing".into()))?,
        _ => return Err(ReplicationError::Protocol("non-JSON challenge".into())),
    };

    let challenge_value = Value::String(challenge);
    let mac = envelope.mac(&challenge_value)?;
    let response = SecurityHandshakeResponse {
        success: true,
        server_id: Some(ctx.node_id.clone()),
        timestamp: Some(now_millis()),
        original_challenge: Some(challenge_value),
        mac: Some(mac),
        security_enabled: true,
        message: None,
    };
    ctx.wire
        .send(from, &Event::SecurityHandshakeResponse(response))
        .await
}

/// Verify a handshake answer against the challenge we issued.
async fn handle_handshake_response(
    ctx: &DispatchCtx,
    from: &str,
    response: SecurityHandshakeResponse,
) -> Result<()> {
    if !response.success {
        warn!(
            peer_id = %from,
            security_enabled = response.security_enabled,
            message = response.message.as_deref().unwrap_or(""),
            "Peer declined security handshake"
        );
        return Ok(());
    }

    let Some(envelope) = ctx.wire.envelope() else {
        return Ok(());
    };

    let issued = {
        let mut state = ctx.state.lock().await;
        state.pending_challenges.remove(from)
    };
    let Some(issued) = issued else {
        warn!(peer_id = %from, "Unsolicited handshake response");
        return Ok(());
    };

    let echoed = response
        .original_challenge
        .as_ref()
        .and_then(Value::as_str)
        .unwrap_or("");
    let mac_ok = response
        .mac
        .as_deref()
        .map(|mac| envelope.verify_mac(&Value::String(issued.clone()), mac))
        .unwrap_or(false);

    if echoed == issued && mac_ok {
        let mut state = ctx.state.lock().await;
        state.verified_peers.insert(from.to_string());
        debug!(peer_id = %from, "Security handshake verified");
    } else {
        warn!(peer_id = %from, "Security handshake verification failed");
    }
    Ok(())
}

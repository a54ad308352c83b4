//! Message types for actor-based communication with the proxy.
//!
//! This module defines the command and response types used for
//! message-passing between callers (transport bindings, the CLI) and the
//! proxy actor. All callers funnel through one mpsc channel; each command
//! carries a oneshot responder, so the actor's event loop is the single
//! serialization point for policy evaluation, wire traffic, and shadow
//! updates.

use crate::codec::Operation;
use crate::error::GuardError;
use crate::wear::ChamberSnapshot;
use serde::Serialize;
use tokio::sync::oneshot;

/// Caller-facing error payload: a stable code plus a human-readable message.
///
/// Policy rejections carry the reject reason as the code; device faults
/// carry the device's error code verbatim.
#[derive(Clone, Debug, Serialize)]
pub struct OutcomeError {
    pub code: String,
    pub message: String,
}

impl From<&GuardError> for OutcomeError {
    fn from(err: &GuardError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Uniform result of every proxy operation.
///
/// `accepted` is true only when the operation was admitted by policy and
/// confirmed by the device. The snapshot always reflects the shadow state
/// after the operation (unmodified when the operation was refused), so
/// callers can observe margin-to-failure without tripping it.
#[derive(Clone, Debug, Serialize)]
pub struct OperationOutcome {
    pub accepted: bool,
    pub state: ChamberSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl OperationOutcome {
    /// Successful, device-confirmed operation.
    pub fn accepted(state: ChamberSnapshot) -> Self {
        Self {
            accepted: true,
            state,
            error: None,
        }
    }

    /// Refused or failed operation; the error explains which.
    pub fn failed(state: ChamberSnapshot, err: &GuardError) -> Self {
        Self {
            accepted: false,
            state,
            error: Some(OutcomeError::from(err)),
        }
    }
}

/// Operability report for the device link.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LinkHealth {
    /// Whether the TCP connection is currently established.
    pub connected: bool,
    /// Whether a status resynchronization is pending after a fault.
    pub needs_resync: bool,
    /// Whether the shadow has latched the device as broken.
    pub broken: bool,
}

/// Commands that can be sent to the proxy actor.
#[derive(Debug)]
pub enum ProxyCommand {
    /// Evaluate, optionally forward, and confirm one operation.
    Execute {
        op: Operation,
        response: oneshot::Sender<OperationOutcome>,
    },

    /// Report link operability.
    LinkHealth {
        response: oneshot::Sender<LinkHealth>,
    },

    /// Stop the actor.
    Shutdown { response: oneshot::Sender<()> },
}

impl ProxyCommand {
    /// Helper to create an Execute command.
    pub fn execute(op: Operation) -> (Self, oneshot::Receiver<OperationOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self::Execute { op, response: tx }, rx)
    }

    /// Helper to create a LinkHealth command.
    pub fn link_health() -> (Self, oneshot::Receiver<LinkHealth>) {
        let (tx, rx) = oneshot::channel();
        (Self::LinkHealth { response: tx }, rx)
    }

    /// Helper to create a Shutdown command.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

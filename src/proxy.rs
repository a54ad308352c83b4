//! The instrument proxy actor.
//!
//! This is the crate's public contract: a single async task owns the shadow
//! state and the device link, and processes caller commands one at a time
//! via message-passing. No two operations ever execute concurrently against
//! the shadow or the wire, which is what keeps the wear counters accurate
//! under concurrent callers.
//!
//! Per operation: evaluate policy against the current shadow; on rejection,
//! return immediately with no wire traffic and an unmodified snapshot. On
//! admission, round-trip the device, then update the shadow from the
//! device's confirmed response (not the optimistic guess). A failed round
//! trip leaves the shadow untouched and forces a status resynchronization
//! before further mutating operations are admitted.

use crate::codec::{decode_reply, is_terminal_code, DeviceReply, Operation};
use crate::error::{GuardError, GuardResult};
use crate::link::DeviceLink;
use crate::messages::{LinkHealth, OperationOutcome, ProxyCommand};
use crate::policy::{self, Decision};
use crate::wear::{ChamberState, Thresholds};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Actor that owns the shadow state and the device connection.
pub struct ProxyActor {
    state: ChamberState,
    limits: Thresholds,
    link: Box<dyn DeviceLink>,
    needs_resync: bool,
}

impl ProxyActor {
    /// Creates an actor around a freshly started device.
    ///
    /// The shadow mirrors a cold chamber; the proxy and the device are
    /// expected to come up together. After any link fault the shadow is no
    /// longer trusted until a status read succeeds.
    pub fn new(link: Box<dyn DeviceLink>, limits: Thresholds) -> Self {
        Self {
            state: ChamberState::new(),
            limits,
            link,
            needs_resync: false,
        }
    }

    /// Runs the actor event loop, processing commands until shutdown.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<ProxyCommand>) {
        info!("Proxy actor started");

        // Eagerly bring the link up so the first caller does not pay the
        // connect latency. Failure is not fatal; commands will surface it.
        if let Err(e) = self.link.ensure_connected().await {
            warn!("Device link not yet reachable: {}", e);
        }

        while let Some(command) = command_rx.recv().await {
            match command {
                ProxyCommand::Execute { op, response } => {
                    let outcome = self.handle_operation(op).await;
                    // A caller that gave up simply dropped its receiver; the
                    // completed round trip's result is discarded.
                    let _ = response.send(outcome);
                }

                ProxyCommand::LinkHealth { response } => {
                    let _ = response.send(LinkHealth {
                        connected: self.link.is_connected(),
                        needs_resync: self.needs_resync,
                        broken: self.state.broken,
                    });
                }

                ProxyCommand::Shutdown { response } => {
                    info!("Proxy actor shutdown requested");
                    let _ = response.send(());
                    break;
                }
            }
        }

        info!("Proxy actor stopped");
    }

    async fn handle_operation(&mut self, op: Operation) -> OperationOutcome {
        // After a fault the shadow may be under- or over-counted relative to
        // the device; only a status read (or a reset) may pass until it has
        // been overwritten from the device's authoritative counters.
        if self.needs_resync && !matches!(op, Operation::GetStatus | Operation::Reset) {
            let err = GuardError::LinkUnavailable(
                "resynchronization pending; a status read must succeed first".to_string(),
            );
            debug!("Deferred {} pending resync", op);
            return OperationOutcome::failed(self.state.snapshot(), &err);
        }

        let wire_op = match policy::evaluate(&self.state, &self.limits, &op) {
            Decision::Reject(reason) => {
                // Expected and frequent; not an operational error.
                debug!("Refused {}: {}", op, reason);
                let err = GuardError::PolicyRejected(reason);
                return OperationOutcome::failed(self.state.snapshot(), &err);
            }
            Decision::Admit {
                throttled_target: Some(capped),
            } => {
                info!(
                    "Throttling {} to a capped step: sending target {:.1}",
                    op, capped
                );
                Operation::SetTemperature(capped)
            }
            Decision::Admit {
                throttled_target: None,
            } => op,
        };

        let raw = match self.link.send_command(&wire_op.encode()).await {
            Ok(raw) => raw,
            Err(err) => {
                // The command may or may not have executed; the shadow stays
                // untouched rather than double-protecting against wear that
                // may never have happened.
                warn!("Link failure during {}: {}", wire_op, err);
                self.needs_resync = true;
                return OperationOutcome::failed(self.state.snapshot(), &err);
            }
        };

        let reply = match decode_reply(&raw) {
            Ok(reply) => reply,
            Err(err) => {
                error!("Protocol error during {}: {}", wire_op, err);
                self.needs_resync = true;
                return OperationOutcome::failed(self.state.snapshot(), &err);
            }
        };

        match reply {
            DeviceReply::Ok(fields) => {
                if matches!(wire_op, Operation::GetStatus) {
                    self.state.absorb_status(&fields);
                    if self.needs_resync {
                        info!("Shadow resynchronized from device status");
                        self.needs_resync = false;
                    }
                } else {
                    self.state.apply_confirmed(&wire_op, &fields);
                }
                OperationOutcome::accepted(self.state.snapshot())
            }
            DeviceReply::Err { code, message } => {
                // An admitted command failing device-side means the shadow
                // disagreed with the device. Surface the device's error
                // verbatim and stop trusting the shadow.
                error!("Device refused admitted {}: {} ({})", wire_op, code, message);
                if is_terminal_code(&code) {
                    self.state.broken = true;
                }
                if !matches!(wire_op, Operation::GetStatus) {
                    self.needs_resync = true;
                }
                let err = GuardError::DeviceFault { code, message };
                OperationOutcome::failed(self.state.snapshot(), &err)
            }
        }
    }
}

/// Cheap, cloneable handle to a running proxy actor.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    /// Submits one operation and waits for its outcome.
    pub async fn execute(&self, op: Operation) -> GuardResult<OperationOutcome> {
        let (cmd, rx) = ProxyCommand::execute(op);
        self.tx.send(cmd).await.map_err(|_| {
            GuardError::LinkUnavailable("proxy actor is not running".to_string())
        })?;
        rx.await
            .map_err(|_| GuardError::LinkUnavailable("proxy actor dropped the request".to_string()))
    }

    /// Reads device status; this is also the resynchronization point.
    pub async fn status(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::GetStatus).await
    }

    pub async fn open_door(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::OpenDoor).await
    }

    pub async fn close_door(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::CloseDoor).await
    }

    pub async fn set_temperature(&self, celsius: f64) -> GuardResult<OperationOutcome> {
        self.execute(Operation::SetTemperature(celsius)).await
    }

    pub async fn start_cycle(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::StartCycle).await
    }

    pub async fn stop_cycle(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::StopCycle).await
    }

    pub async fn emergency_stop(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::EmergencyStop).await
    }

    pub async fn calibrate(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::Calibrate).await
    }

    pub async fn reset(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::Reset).await
    }

    pub async fn temperature(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::GetTemperature).await
    }

    pub async fn maintenance_mode(&self) -> GuardResult<OperationOutcome> {
        self.execute(Operation::MaintenanceMode).await
    }

    /// Reports link operability without touching the wire.
    pub async fn link_health(&self) -> GuardResult<LinkHealth> {
        let (cmd, rx) = ProxyCommand::link_health();
        self.tx.send(cmd).await.map_err(|_| {
            GuardError::LinkUnavailable("proxy actor is not running".to_string())
        })?;
        rx.await
            .map_err(|_| GuardError::LinkUnavailable("proxy actor dropped the request".to_string()))
    }

    /// Stops the actor. In-flight operations complete first.
    pub async fn shutdown(&self) -> GuardResult<()> {
        let (cmd, rx) = ProxyCommand::shutdown();
        self.tx.send(cmd).await.map_err(|_| {
            GuardError::LinkUnavailable("proxy actor is not running".to_string())
        })?;
        let _ = rx.await;
        Ok(())
    }
}

/// Spawns the proxy actor on the current runtime.
pub fn spawn_proxy(
    link: Box<dyn DeviceLink>,
    limits: Thresholds,
    channel_capacity: usize,
) -> (ProxyHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(channel_capacity);
    let actor = ProxyActor::new(link, limits);
    let task = tokio::spawn(actor.run(rx));
    (ProxyHandle { tx }, task)
}

//! Simulated chamber and mock device link.
//!
//! [`SimulatedChamber`] is a wire-accurate double of the instrument: it
//! speaks the same line protocol, keeps the same wear counters, and breaks
//! permanently at the same documented thresholds. It backs the integration
//! tests and the binary's `--mock` mode, where [`serve`] exposes it over a
//! real TCP listener.
//!
//! [`MockDeviceLink`] implements [`DeviceLink`] directly against a shared
//! chamber, with a scriptable fault queue so tests can drop the connection
//! before a command is sent, or execute a command device-side and lose its
//! confirmation. Those are the two drift cases the proxy's resynchronization
//! handles.

use crate::error::{GuardError, GuardResult};
use crate::link::DeviceLink;
use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

// Internal protection thresholds of the real device. The proxy's policy
// constants mirror these minus its safety margin; the device itself enforces
// them reactively, destroying hardware at the moment of violation.
const DEVICE_DOOR_CYCLE_LIMIT: u64 = 10;
const DEVICE_TEMP_CHANGE_LIMIT: u64 = 15;
const DEVICE_THERMAL_SHOCK_DELTA: f64 = 50.0;
const DEVICE_RAPID_CHANGE_DELTA: f64 = 30.0;
const DEVICE_STOP_CYCLE_LIMIT: u64 = 8;
const DEVICE_EMERGENCY_STOP_LIMIT: u64 = 3;
const DEVICE_DOOR_OPEN_CALIBRATION_LIMIT: u64 = 2;
const DEVICE_TEMP_MIN: f64 = -20.0;
const DEVICE_TEMP_MAX: f64 = 120.0;

/// In-process double of the fragile thermal chamber.
///
/// All fields are public so tests can assert on the device's ground truth
/// (and inject out-of-band wear) without going through the wire.
#[derive(Debug)]
pub struct SimulatedChamber {
    pub door_open: bool,
    pub current_temp: f64,
    pub target_temp: f64,
    pub cycle_running: bool,
    pub emergency_stopped: bool,
    pub maintenance_mode: bool,
    pub broken: bool,
    pub door_cycles: u64,
    pub temp_changes: u64,
    pub stop_cycles: u64,
    pub emergency_stops: u64,
    pub door_open_calibrations: u64,
}

impl Default for SimulatedChamber {
    fn default() -> Self {
        Self {
            door_open: false,
            current_temp: 20.0,
            target_temp: 20.0,
            cycle_running: false,
            emergency_stopped: false,
            maintenance_mode: false,
            broken: false,
            door_cycles: 0,
            temp_changes: 0,
            stop_cycles: 0,
            emergency_stops: 0,
            door_open_calibrations: 0,
        }
    }
}

fn err_reply(code: &str, message: &str) -> String {
    json!({ "error": code, "message": message }).to_string()
}

impl SimulatedChamber {
    /// A freshly powered chamber.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one command line and returns the single response line.
    pub fn handle_line(&mut self, line: &str) -> String {
        let mut parts = line.trim().split_whitespace();
        let verb = parts.next().unwrap_or("");
        let arg = parts.next();

        // A broken chamber still reports its state but executes nothing.
        if self.broken && !matches!(verb, "STATUS" | "RESET" | "GET_TEMP") {
            return err_reply("DEVICE_BROKEN", "device has failed permanently");
        }

        match verb {
            "STATUS" => self.status_reply(),

            "OPEN_DOOR" => {
                if self.cycle_running {
                    return err_reply("CYCLE_RUNNING", "cannot open door during a cycle");
                }
                if self.door_cycles + 1 > DEVICE_DOOR_CYCLE_LIMIT {
                    self.broken = true;
                    return err_reply(
                        "DOOR_MECHANISM_DAMAGE",
                        "door mechanism destroyed by excessive cycling",
                    );
                }
                self.door_cycles += 1;
                self.door_open = true;
                json!({
                    "status": "OK",
                    "door_open": self.door_open,
                    "door_cycles": self.door_cycles,
                })
                .to_string()
            }

            "CLOSE_DOOR" => {
                self.door_open = false;
                json!({
                    "status": "OK",
                    "door_open": self.door_open,
                    "door_cycles": self.door_cycles,
                })
                .to_string()
            }

            "SET_TEMP" => {
                let Some(target) = arg.and_then(|a| a.parse::<f64>().ok()) else {
                    return err_reply("BAD_ARGUMENT", "SET_TEMP requires a numeric argument");
                };
                if !(DEVICE_TEMP_MIN..=DEVICE_TEMP_MAX).contains(&target) {
                    return err_reply("TEMP_OUT_OF_RANGE", "setpoint outside [-20, 120]");
                }
                if self.temp_changes + 1 > DEVICE_TEMP_CHANGE_LIMIT {
                    self.broken = true;
                    return err_reply(
                        "THERMAL_SYSTEM_DAMAGE",
                        "thermal system worn out by setpoint changes",
                    );
                }
                let delta = (target - self.current_temp).abs();
                if delta > DEVICE_THERMAL_SHOCK_DELTA {
                    self.broken = true;
                    return err_reply("THERMAL_SHOCK_DAMAGE", "chamber cracked by thermal shock");
                }
                self.temp_changes += 1;
                self.current_temp = target;
                self.target_temp = target;
                let mut reply = json!({
                    "status": "OK",
                    "current_temp": self.current_temp,
                    "target_temp": self.target_temp,
                    "temp_changes": self.temp_changes,
                });
                if delta > DEVICE_RAPID_CHANGE_DELTA {
                    reply["warning"] = json!("RAPID_TEMP_CHANGE");
                }
                reply.to_string()
            }

            "START_CYCLE" => {
                if self.door_open {
                    return err_reply("DOOR_OPEN", "close the door before starting a cycle");
                }
                if self.cycle_running {
                    return err_reply("CYCLE_ALREADY_RUNNING", "a cycle is already running");
                }
                if self.maintenance_mode {
                    return err_reply("MAINTENANCE_MODE", "chamber is in maintenance mode");
                }
                self.cycle_running = true;
                json!({ "status": "OK", "cycle_running": true }).to_string()
            }

            "STOP_CYCLE" => {
                if !self.cycle_running {
                    return err_reply("NO_CYCLE_RUNNING", "no cycle to stop");
                }
                if self.stop_cycles + 1 > DEVICE_STOP_CYCLE_LIMIT {
                    self.broken = true;
                    return err_reply(
                        "CONTROL_SYSTEM_DAMAGE",
                        "cycle controller destroyed by repeated aborts",
                    );
                }
                self.stop_cycles += 1;
                self.cycle_running = false;
                // Stop count deliberately not echoed; clients track it.
                json!({ "status": "OK", "cycle_running": false }).to_string()
            }

            "EMERGENCY_STOP" => {
                if self.emergency_stops + 1 > DEVICE_EMERGENCY_STOP_LIMIT {
                    self.broken = true;
                    return err_reply(
                        "SAFETY_LOCKOUT_DAMAGE",
                        "safety lockout engaged permanently",
                    );
                }
                self.emergency_stops += 1;
                self.cycle_running = false;
                self.emergency_stopped = true;
                json!({
                    "status": "OK",
                    "cycle_running": false,
                    "emergency_stopped": true,
                    "emergency_stops": self.emergency_stops,
                })
                .to_string()
            }

            "CALIBRATE" => {
                if self.cycle_running {
                    return err_reply("CYCLE_RUNNING", "cannot calibrate during a cycle");
                }
                if self.door_open {
                    if self.door_open_calibrations + 1 > DEVICE_DOOR_OPEN_CALIBRATION_LIMIT {
                        self.broken = true;
                        return err_reply(
                            "SENSOR_DAMAGE",
                            "sensor destroyed by open-door calibration",
                        );
                    }
                    self.door_open_calibrations += 1;
                }
                // Calibration count deliberately not echoed.
                json!({ "status": "OK" }).to_string()
            }

            "RESET" => {
                // Clears transient state only; damage and wear are physical.
                self.cycle_running = false;
                self.emergency_stopped = false;
                self.maintenance_mode = false;
                json!({
                    "status": "OK",
                    "cycle_running": false,
                    "emergency_stopped": false,
                    "maintenance_mode": false,
                    "broken": self.broken,
                })
                .to_string()
            }

            "GET_TEMP" => json!({
                "status": "OK",
                "current_temp": self.current_temp,
                "target_temp": self.target_temp,
            })
            .to_string(),

            "MAINTENANCE_MODE" => {
                if self.cycle_running {
                    return err_reply("CYCLE_RUNNING", "cannot toggle maintenance during a cycle");
                }
                self.maintenance_mode = !self.maintenance_mode;
                json!({ "status": "OK", "maintenance_mode": self.maintenance_mode }).to_string()
            }

            _ => err_reply("UNKNOWN_COMMAND", "unrecognized command"),
        }
    }

    fn status_reply(&self) -> String {
        json!({
            "status": "OK",
            "door_open": self.door_open,
            "current_temp": self.current_temp,
            "target_temp": self.target_temp,
            "cycle_running": self.cycle_running,
            "emergency_stopped": self.emergency_stopped,
            "maintenance_mode": self.maintenance_mode,
            "broken": self.broken,
            "door_cycles": self.door_cycles,
            "temp_changes": self.temp_changes,
            "stop_cycles": self.stop_cycles,
            "emergency_stops": self.emergency_stops,
            "door_open_calibrations": self.door_open_calibrations,
        })
        .to_string()
    }
}

/// Serves a simulated chamber over TCP, one spawned task per connection.
///
/// Used by the binary's `--mock` mode and the TCP link tests. The real
/// device accepts a single client; the proxy only ever opens one connection,
/// so accepting reconnects here costs nothing.
pub async fn serve(listener: TcpListener, chamber: Arc<Mutex<SimulatedChamber>>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Mock chamber accept failed: {}", e);
                break;
            }
        };
        debug!("Mock chamber accepted connection from {}", peer);
        let chamber = chamber.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = chamber.lock().await.handle_line(&line);
                if write_half
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

/// Scriptable link faults for recovery tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkFault {
    /// The connection dies before the command is written; the device never
    /// sees it.
    DropBeforeSend,
    /// The device executes the command but its confirmation is lost; the
    /// caller observes a timeout and the shadow is left behind the device.
    LoseResponse,
}

/// [`DeviceLink`] implementation backed by an in-process chamber.
pub struct MockDeviceLink {
    chamber: Arc<Mutex<SimulatedChamber>>,
    faults: Arc<Mutex<VecDeque<LinkFault>>>,
    connected: bool,
    round_trip_timeout: Duration,
}

impl MockDeviceLink {
    pub fn new() -> Self {
        Self {
            chamber: Arc::new(Mutex::new(SimulatedChamber::new())),
            faults: Arc::new(Mutex::new(VecDeque::new())),
            connected: false,
            round_trip_timeout: Duration::from_secs(2),
        }
    }

    /// Shared handle to the device's ground truth.
    pub fn chamber(&self) -> Arc<Mutex<SimulatedChamber>> {
        self.chamber.clone()
    }

    /// Shared handle to the fault queue; push faults to script failures for
    /// upcoming commands, in order.
    pub fn fault_queue(&self) -> Arc<Mutex<VecDeque<LinkFault>>> {
        self.faults.clone()
    }
}

impl Default for MockDeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLink for MockDeviceLink {
    async fn send_command(&mut self, line: &str) -> GuardResult<String> {
        let fault = self.faults.lock().await.pop_front();
        match fault {
            Some(LinkFault::DropBeforeSend) => {
                self.connected = false;
                Err(GuardError::LinkUnavailable(
                    "simulated connection drop before send".to_string(),
                ))
            }
            Some(LinkFault::LoseResponse) => {
                let _ = self.chamber.lock().await.handle_line(line);
                self.connected = false;
                Err(GuardError::LinkTimeout(self.round_trip_timeout))
            }
            None => {
                self.connected = true;
                Ok(self.chamber.lock().await.handle_line(line))
            }
        }
    }

    async fn ensure_connected(&mut self) -> GuardResult<()> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eleventh_open_destroys_door_mechanism() {
        let mut chamber = SimulatedChamber::new();
        for _ in 0..10 {
            let reply = chamber.handle_line("OPEN_DOOR");
            assert!(reply.contains("\"OK\""), "{}", reply);
            chamber.handle_line("CLOSE_DOOR");
        }
        assert_eq!(chamber.door_cycles, 10);

        let reply = chamber.handle_line("OPEN_DOOR");
        assert!(reply.contains("DOOR_MECHANISM_DAMAGE"), "{}", reply);
        assert!(chamber.broken);
        assert_eq!(chamber.door_cycles, 10, "counter must not exceed the limit");
    }

    #[test]
    fn test_thermal_shock_cracks_chamber() {
        let mut chamber = SimulatedChamber::new();
        let reply = chamber.handle_line("SET_TEMP 95.0");
        assert!(reply.contains("THERMAL_SHOCK_DAMAGE"), "{}", reply);
        assert!(chamber.broken);
        assert_eq!(chamber.current_temp, 20.0);
    }

    #[test]
    fn test_rapid_change_warns_but_executes() {
        let mut chamber = SimulatedChamber::new();
        let reply = chamber.handle_line("SET_TEMP 55.0");
        assert!(reply.contains("\"OK\""), "{}", reply);
        assert!(reply.contains("RAPID_TEMP_CHANGE"), "{}", reply);
        assert_eq!(chamber.current_temp, 55.0);
        assert!(!chamber.broken);
    }

    #[test]
    fn test_broken_chamber_still_reports_status() {
        let mut chamber = SimulatedChamber::new();
        chamber.broken = true;

        let status = chamber.handle_line("STATUS");
        assert!(status.contains("\"broken\":true"), "{}", status);

        let reply = chamber.handle_line("OPEN_DOOR");
        assert!(reply.contains("DEVICE_BROKEN"), "{}", reply);
    }

    #[test]
    fn test_reset_clears_transients_but_not_damage() {
        let mut chamber = SimulatedChamber::new();
        chamber.handle_line("EMERGENCY_STOP");
        chamber.broken = true;

        let reply = chamber.handle_line("RESET");
        assert!(reply.contains("\"OK\""), "{}", reply);
        assert!(!chamber.emergency_stopped);
        assert!(chamber.broken, "reset cannot repair hardware damage");
        assert_eq!(chamber.emergency_stops, 1, "wear survives a reset");
    }

    #[test]
    fn test_stop_cycle_does_not_echo_its_counter() {
        let mut chamber = SimulatedChamber::new();
        chamber.handle_line("START_CYCLE");
        let reply = chamber.handle_line("STOP_CYCLE");
        assert!(reply.contains("\"OK\""), "{}", reply);
        assert!(!reply.contains("stop_cycles"), "{}", reply);
        assert_eq!(chamber.stop_cycles, 1);
    }

    #[test]
    fn test_open_door_calibration_limit() {
        let mut chamber = SimulatedChamber::new();
        chamber.handle_line("OPEN_DOOR");
        assert!(chamber.handle_line("CALIBRATE").contains("\"OK\""));
        assert!(chamber.handle_line("CALIBRATE").contains("\"OK\""));
        let reply = chamber.handle_line("CALIBRATE");
        assert!(reply.contains("SENSOR_DAMAGE"), "{}", reply);
        assert!(chamber.broken);
        assert_eq!(chamber.door_open_calibrations, 2);
    }

    #[test]
    fn test_unknown_command() {
        let mut chamber = SimulatedChamber::new();
        let reply = chamber.handle_line("FROBNICATE");
        assert!(reply.contains("UNKNOWN_COMMAND"), "{}", reply);
    }

    #[tokio::test]
    async fn test_mock_link_fault_queue() {
        let mut link = MockDeviceLink::new();
        link.fault_queue()
            .lock()
            .await
            .push_back(LinkFault::LoseResponse);

        // The command executes device-side even though the reply is lost.
        let err = link.send_command("OPEN_DOOR").await.unwrap_err();
        assert!(matches!(err, GuardError::LinkTimeout(_)));
        assert!(!link.is_connected());
        assert_eq!(link.chamber().lock().await.door_cycles, 1);

        // Next command flows normally.
        let reply = link.send_command("STATUS").await.unwrap();
        assert!(reply.contains("\"door_cycles\":1"), "{}", reply);
    }
}

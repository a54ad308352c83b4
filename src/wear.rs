//! Shadow wear model for the thermal chamber.
//!
//! The chamber's internal protections depend on cumulative wear counters that
//! the device itself only enforces reactively. This module keeps a local
//! mirror of every one of those counters plus the chamber's operational
//! flags, so the policy engine can refuse a damaging command before it ever
//! reaches the wire.
//!
//! The shadow is owned exclusively by the proxy actor and mutated only inside
//! its event loop. Two update paths exist:
//!
//! - [`ChamberState::apply_confirmed`] folds in a single confirmed command
//!   response, preferring counters the device echoes over local increments.
//! - [`ChamberState::absorb_status`] fully overwrites the shadow from a
//!   `STATUS` reply. This is the resynchronization point after a link drop,
//!   where the device's counters are authoritative even if lower than ours.
//!
//! The `broken` flag is a latch: once set it survives every update path and
//! only a process restart clears it.

use crate::codec::{Operation, ReplyFields};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Damage thresholds of the chamber, as documented by the manufacturer,
/// plus the proxy's own policy constants.
///
/// Loaded once at startup and never mutated. `safety_margin` is subtracted
/// from every counter limit before the policy compares against it, so the
/// proxy intervenes at least one unit before the device's own protection
/// would trip; the margin absorbs shadow/device drift after a lost
/// confirmation. `rapid_step_cap` bounds the temperature delta of a single
/// admitted `SET_TEMP`; it sits between the rapid-change warning band
/// (30 °C) and the thermal-shock rating (50 °C) so an admitted jump can
/// never approach the shock threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Door actuations before the mechanism fails (device limit).
    pub door_cycle_limit: u64,
    /// Temperature setpoint changes before the thermal system fails.
    pub temp_change_limit: u64,
    /// Cycle stops before the control system fails.
    pub stop_cycle_limit: u64,
    /// Emergency stops before the safety lockout engages permanently.
    pub emergency_stop_limit: u64,
    /// Calibrations with the door open before the sensor is destroyed.
    pub door_open_calibration_limit: u64,
    /// Temperature delta that cracks the chamber outright (°C).
    pub thermal_shock_delta: f64,
    /// Temperature delta the device flags as dangerously rapid (°C).
    pub rapid_change_delta: f64,
    /// Largest temperature step the policy admits in one call (°C).
    pub rapid_step_cap: f64,
    /// Lowest accepted setpoint (°C).
    pub temp_min: f64,
    /// Highest accepted setpoint (°C).
    pub temp_max: f64,
    /// Units subtracted from each counter limit before policy comparison.
    pub safety_margin: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            door_cycle_limit: 10,
            temp_change_limit: 15,
            stop_cycle_limit: 8,
            emergency_stop_limit: 3,
            door_open_calibration_limit: 2,
            thermal_shock_delta: 50.0,
            rapid_change_delta: 30.0,
            rapid_step_cap: 40.0,
            temp_min: -20.0,
            temp_max: 120.0,
            safety_margin: 1,
        }
    }
}

impl Thresholds {
    /// Counter limit with the preemptive safety margin applied.
    pub fn effective(&self, device_limit: u64) -> u64 {
        device_limit.saturating_sub(self.safety_margin)
    }
}

/// In-memory shadow of the chamber's wear state.
///
/// Mirrors a freshly started device at construction; the proxy and the
/// device are expected to come up together.
#[derive(Clone, Debug, PartialEq)]
pub struct ChamberState {
    pub door_open: bool,
    pub current_temp: f64,
    pub target_temp: f64,
    pub cycle_running: bool,
    pub emergency_stopped: bool,
    pub maintenance_mode: bool,
    pub broken: bool,
    pub door_cycle_count: u64,
    pub temp_change_count: u64,
    pub stop_cycle_count: u64,
    pub emergency_stop_count: u64,
    pub door_open_calibration_count: u64,
}

/// Ambient temperature a freshly powered chamber reports.
const AMBIENT_TEMP: f64 = 20.0;

impl Default for ChamberState {
    fn default() -> Self {
        Self {
            door_open: false,
            current_temp: AMBIENT_TEMP,
            target_temp: AMBIENT_TEMP,
            cycle_running: false,
            emergency_stopped: false,
            maintenance_mode: false,
            broken: false,
            door_cycle_count: 0,
            temp_change_count: 0,
            stop_cycle_count: 0,
            emergency_stop_count: 0,
            door_open_calibration_count: 0,
        }
    }
}

impl ChamberState {
    /// Shadow of a freshly started device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the shadow for callers.
    pub fn snapshot(&self) -> ChamberSnapshot {
        ChamberSnapshot {
            observed_at: Utc::now(),
            door_open: self.door_open,
            current_temp: self.current_temp,
            target_temp: self.target_temp,
            cycle_running: self.cycle_running,
            emergency_stopped: self.emergency_stopped,
            maintenance_mode: self.maintenance_mode,
            broken: self.broken,
            door_cycles: self.door_cycle_count,
            temp_changes: self.temp_change_count,
            stop_cycles: self.stop_cycle_count,
            emergency_stops: self.emergency_stop_count,
            door_open_calibrations: self.door_open_calibration_count,
        }
    }

    /// Fully overwrites the shadow from a `STATUS` reply.
    ///
    /// The device's counters are authoritative here and may be lower than
    /// the shadow if a prior confirmation was lost mid-flight. `broken`
    /// stays latched regardless of what the device reports.
    pub fn absorb_status(&mut self, reply: &ReplyFields) {
        self.door_open = reply.door_open.unwrap_or(self.door_open);
        self.current_temp = reply.current_temp.unwrap_or(self.current_temp);
        self.target_temp = reply.target_temp.unwrap_or(self.target_temp);
        self.cycle_running = reply.cycle_running.unwrap_or(self.cycle_running);
        self.emergency_stopped = reply.emergency_stopped.unwrap_or(self.emergency_stopped);
        self.maintenance_mode = reply.maintenance_mode.unwrap_or(self.maintenance_mode);
        self.broken = self.broken || reply.broken.unwrap_or(false);
        if let Some(c) = reply.door_cycles {
            self.door_cycle_count = c;
        }
        if let Some(c) = reply.temp_changes {
            self.temp_change_count = c;
        }
        if let Some(c) = reply.stop_cycles {
            self.stop_cycle_count = c;
        }
        if let Some(c) = reply.emergency_stops {
            self.emergency_stop_count = c;
        }
        if let Some(c) = reply.door_open_calibrations {
            self.door_open_calibration_count = c;
        }
    }

    /// Folds a confirmed command response into the shadow.
    ///
    /// Counters the device echoes win over the local guess, guarded so they
    /// never decrease outside a full resync. Where the device does not echo
    /// a counter, the local increment stands in until the next `STATUS`.
    pub fn apply_confirmed(&mut self, op: &Operation, reply: &ReplyFields) {
        if reply.broken.unwrap_or(false) {
            self.broken = true;
        }

        match op {
            Operation::GetStatus => self.absorb_status(reply),
            Operation::OpenDoor => {
                self.door_open = reply.door_open.unwrap_or(true);
                self.door_cycle_count = reply
                    .door_cycles
                    .map_or(self.door_cycle_count + 1, |c| c.max(self.door_cycle_count));
            }
            Operation::CloseDoor => {
                self.door_open = reply.door_open.unwrap_or(false);
                if let Some(c) = reply.door_cycles {
                    self.door_cycle_count = c.max(self.door_cycle_count);
                }
            }
            Operation::SetTemperature(target) => {
                self.temp_change_count = reply
                    .temp_changes
                    .map_or(self.temp_change_count + 1, |c| c.max(self.temp_change_count));
                self.current_temp = reply.current_temp.unwrap_or(*target);
                self.target_temp = reply.target_temp.unwrap_or(*target);
            }
            Operation::StartCycle => {
                self.cycle_running = reply.cycle_running.unwrap_or(true);
            }
            Operation::StopCycle => {
                self.cycle_running = reply.cycle_running.unwrap_or(false);
                self.stop_cycle_count = reply
                    .stop_cycles
                    .map_or(self.stop_cycle_count + 1, |c| c.max(self.stop_cycle_count));
            }
            Operation::EmergencyStop => {
                self.cycle_running = reply.cycle_running.unwrap_or(false);
                self.emergency_stopped = reply.emergency_stopped.unwrap_or(true);
                self.emergency_stop_count = reply
                    .emergency_stops
                    .map_or(self.emergency_stop_count + 1, |c| {
                        c.max(self.emergency_stop_count)
                    });
            }
            Operation::Calibrate => {
                if self.door_open {
                    self.door_open_calibration_count =
                        reply.door_open_calibrations.map_or(
                            self.door_open_calibration_count + 1,
                            |c| c.max(self.door_open_calibration_count),
                        );
                }
            }
            Operation::Reset => {
                self.cycle_running = reply.cycle_running.unwrap_or(false);
                self.emergency_stopped = reply.emergency_stopped.unwrap_or(false);
                self.maintenance_mode = reply.maintenance_mode.unwrap_or(false);
            }
            Operation::GetTemperature => {
                if let Some(t) = reply.current_temp {
                    self.current_temp = t;
                }
                if let Some(t) = reply.target_temp {
                    self.target_temp = t;
                }
            }
            Operation::MaintenanceMode => {
                self.maintenance_mode = reply.maintenance_mode.unwrap_or(!self.maintenance_mode);
            }
        }
    }
}

/// Caller-facing snapshot of the shadow state.
///
/// Exposes the wear counters so callers can observe margin-to-failure
/// without tripping it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChamberSnapshot {
    /// When the proxy took this snapshot (UTC).
    pub observed_at: DateTime<Utc>,
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

impl ChamberSnapshot {
    /// Field-wise equality ignoring `observed_at`.
    ///
    /// Two consecutive status reads with no intervening mutation must agree
    /// on every reading even though their timestamps differ.
    pub fn readings_eq(&self, other: &Self) -> bool {
        let a = Self {
            observed_at: other.observed_at,
            ..self.clone()
        };
        a == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_reply(door_cycles: u64, broken: bool) -> ReplyFields {
        ReplyFields {
            door_open: Some(false),
            current_temp: Some(42.0),
            target_temp: Some(42.0),
            cycle_running: Some(false),
            emergency_stopped: Some(false),
            maintenance_mode: Some(false),
            broken: Some(broken),
            door_cycles: Some(door_cycles),
            temp_changes: Some(3),
            stop_cycles: Some(1),
            emergency_stops: Some(0),
            door_open_calibrations: Some(0),
        }
    }

    #[test]
    fn test_fresh_shadow_mirrors_cold_device() {
        let state = ChamberState::new();
        assert!(!state.door_open);
        assert!(!state.broken);
        assert_eq!(state.current_temp, 20.0);
        assert_eq!(state.door_cycle_count, 0);
    }

    #[test]
    fn test_absorb_status_overwrites_counters_even_downward() {
        let mut state = ChamberState::new();
        state.door_cycle_count = 5;
        state.absorb_status(&status_reply(3, false));
        assert_eq!(state.door_cycle_count, 3);
        assert_eq!(state.current_temp, 42.0);
    }

    #[test]
    fn test_broken_latch_survives_status_overwrite() {
        let mut state = ChamberState::new();
        state.broken = true;
        state.absorb_status(&status_reply(0, false));
        assert!(state.broken, "broken must not clear without a restart");
    }

    #[test]
    fn test_confirmed_open_prefers_device_echo() {
        let mut state = ChamberState::new();
        state.door_cycle_count = 2;
        let reply = ReplyFields {
            door_open: Some(true),
            door_cycles: Some(4),
            ..ReplyFields::default()
        };
        state.apply_confirmed(&Operation::OpenDoor, &reply);
        assert!(state.door_open);
        assert_eq!(state.door_cycle_count, 4);
    }

    #[test]
    fn test_confirmed_open_falls_back_to_local_increment() {
        let mut state = ChamberState::new();
        state.door_cycle_count = 2;
        state.apply_confirmed(&Operation::OpenDoor, &ReplyFields::default());
        assert_eq!(state.door_cycle_count, 3);
    }

    #[test]
    fn test_confirmed_counters_never_decrease() {
        let mut state = ChamberState::new();
        state.emergency_stop_count = 2;
        let reply = ReplyFields {
            emergency_stops: Some(1),
            ..ReplyFields::default()
        };
        state.apply_confirmed(&Operation::EmergencyStop, &reply);
        assert_eq!(state.emergency_stop_count, 2);
    }

    #[test]
    fn test_calibrate_counts_only_with_door_open() {
        let mut state = ChamberState::new();
        state.apply_confirmed(&Operation::Calibrate, &ReplyFields::default());
        assert_eq!(state.door_open_calibration_count, 0);

        state.door_open = true;
        state.apply_confirmed(&Operation::Calibrate, &ReplyFields::default());
        assert_eq!(state.door_open_calibration_count, 1);
    }

    #[test]
    fn test_set_temp_updates_temps_from_echo() {
        let mut state = ChamberState::new();
        let reply = ReplyFields {
            current_temp: Some(38.5),
            target_temp: Some(40.0),
            temp_changes: Some(1),
            ..ReplyFields::default()
        };
        state.apply_confirmed(&Operation::SetTemperature(40.0), &reply);
        assert_eq!(state.current_temp, 38.5);
        assert_eq!(state.target_temp, 40.0);
        assert_eq!(state.temp_change_count, 1);
    }

    #[test]
    fn test_effective_limit_applies_margin() {
        let limits = Thresholds::default();
        assert_eq!(limits.effective(10), 9);
        assert_eq!(limits.effective(2), 1);
        assert_eq!(limits.effective(0), 0);
    }

    #[test]
    fn test_snapshot_readings_eq_ignores_timestamp() {
        let state = ChamberState::new();
        let a = state.snapshot();
        let b = state.snapshot();
        assert!(a.readings_eq(&b));
    }
}

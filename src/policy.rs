//! Preemptive safety policy for the thermal chamber.
//!
//! The device only reports damage after it has happened, so admission is
//! decided here, locally, before any wire traffic. [`evaluate`] is a pure
//! function of the shadow state, the configured thresholds, and the
//! requested operation; it never mutates anything. Counter rules compare
//! against the device limit minus the configured safety margin, so the proxy
//! always intervenes at least one unit before the device's own protection
//! would trip even if the shadow has drifted by a lost confirmation.
//!
//! Temperature requests in the rapid-change band are not refused outright:
//! any admitted jump is capped at `rapid_step_cap` (40 °C by default, safely
//! under the 50 °C shock rating), and the caller observes the confirmed
//! partial move in the returned snapshot. Jumps past the shock rating on a
//! chamber that has already seen setpoint changes are rejected.

use crate::codec::Operation;
use crate::wear::{ChamberState, Thresholds};
use serde::Serialize;
use std::fmt;

/// Typed refusal reasons, surfaced verbatim to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    DoorMechanismProtection,
    ThermalSystemProtection,
    ThermalShockProtection,
    ControlSystemProtection,
    SafetyLockoutProtection,
    SensorDamageProtection,
    CycleRunning,
    CycleAlreadyRunning,
    NoCycleRunning,
    DoorOpen,
    MaintenanceMode,
    OutOfRange,
    DeviceBroken,
}

impl RejectReason {
    /// Stable identifier used in caller-facing outcomes.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::DoorMechanismProtection => "DoorMechanismProtection",
            RejectReason::ThermalSystemProtection => "ThermalSystemProtection",
            RejectReason::ThermalShockProtection => "ThermalShockProtection",
            RejectReason::ControlSystemProtection => "ControlSystemProtection",
            RejectReason::SafetyLockoutProtection => "SafetyLockoutProtection",
            RejectReason::SensorDamageProtection => "SensorDamageProtection",
            RejectReason::CycleRunning => "CycleRunning",
            RejectReason::CycleAlreadyRunning => "CycleAlreadyRunning",
            RejectReason::NoCycleRunning => "NoCycleRunning",
            RejectReason::DoorOpen => "DoorOpen",
            RejectReason::MaintenanceMode => "MaintenanceMode",
            RejectReason::OutOfRange => "OutOfRange",
            RejectReason::DeviceBroken => "DeviceBroken",
        }
    }

    /// Human-readable explanation for the refusal.
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::DoorMechanismProtection => {
                "door mechanism is at its rated cycle count; further actuation would destroy it"
            }
            RejectReason::ThermalSystemProtection => {
                "thermal system is at its rated setpoint-change count"
            }
            RejectReason::ThermalShockProtection => {
                "requested temperature jump exceeds the thermal shock rating"
            }
            RejectReason::ControlSystemProtection => {
                "cycle controller is at its rated stop count"
            }
            RejectReason::SafetyLockoutProtection => {
                "emergency stop is at its rated trigger count"
            }
            RejectReason::SensorDamageProtection => {
                "calibrating with the door open again would destroy the sensor"
            }
            RejectReason::CycleRunning => "a processing cycle is running",
            RejectReason::CycleAlreadyRunning => "a processing cycle is already running",
            RejectReason::NoCycleRunning => "no processing cycle is running",
            RejectReason::DoorOpen => "the chamber door is open",
            RejectReason::MaintenanceMode => "the chamber is in maintenance mode",
            RejectReason::OutOfRange => "requested temperature is outside the valid range",
            RejectReason::DeviceBroken => "the device has reported permanent damage",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.as_str(), self.message())
    }
}

/// Result of policy evaluation. Computed from a read of the shadow state;
/// mutation happens only after a device round trip confirms the operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// Forward to the device. `throttled_target` is set when a temperature
    /// request was capped to keep the admitted step inside the safe band;
    /// the capped value is what actually goes on the wire.
    Admit { throttled_target: Option<f64> },
    /// Refuse locally; no wire traffic occurs.
    Reject(RejectReason),
}

impl Decision {
    fn admit() -> Self {
        Decision::Admit {
            throttled_target: None,
        }
    }
}

/// Evaluates whether `op` may reach the wire given the current shadow state.
pub fn evaluate(state: &ChamberState, limits: &Thresholds, op: &Operation) -> Decision {
    // Status reads and reset are always forwarded; reset cannot clear a
    // device-side broken state but must still be reportable.
    if matches!(op, Operation::GetStatus | Operation::Reset) {
        return Decision::admit();
    }

    if state.broken && !op.is_read_only() {
        return Decision::Reject(RejectReason::DeviceBroken);
    }

    match op {
        Operation::GetStatus | Operation::Reset => Decision::admit(),
        Operation::GetTemperature => Decision::admit(),

        Operation::OpenDoor => {
            if state.cycle_running {
                Decision::Reject(RejectReason::CycleRunning)
            } else if state.door_cycle_count + 1 > limits.effective(limits.door_cycle_limit) {
                Decision::Reject(RejectReason::DoorMechanismProtection)
            } else {
                Decision::admit()
            }
        }

        Operation::CloseDoor => Decision::admit(),

        Operation::SetTemperature(target) => {
            evaluate_set_temperature(state, limits, *target)
        }

        Operation::StartCycle => {
            if state.door_open {
                Decision::Reject(RejectReason::DoorOpen)
            } else if state.cycle_running {
                Decision::Reject(RejectReason::CycleAlreadyRunning)
            } else if state.maintenance_mode {
                Decision::Reject(RejectReason::MaintenanceMode)
            } else {
                Decision::admit()
            }
        }

        Operation::StopCycle => {
            if !state.cycle_running {
                Decision::Reject(RejectReason::NoCycleRunning)
            } else if state.stop_cycle_count + 1 > limits.effective(limits.stop_cycle_limit) {
                Decision::Reject(RejectReason::ControlSystemProtection)
            } else {
                Decision::admit()
            }
        }

        Operation::EmergencyStop => {
            if state.emergency_stop_count + 1 > limits.effective(limits.emergency_stop_limit) {
                Decision::Reject(RejectReason::SafetyLockoutProtection)
            } else {
                Decision::admit()
            }
        }

        Operation::Calibrate => {
            if state.cycle_running {
                Decision::Reject(RejectReason::CycleRunning)
            } else if state.door_open
                && state.door_open_calibration_count + 1
                    > limits.effective(limits.door_open_calibration_limit)
            {
                Decision::Reject(RejectReason::SensorDamageProtection)
            } else {
                Decision::admit()
            }
        }

        Operation::MaintenanceMode => {
            if state.cycle_running {
                Decision::Reject(RejectReason::CycleRunning)
            } else {
                Decision::admit()
            }
        }
    }
}

fn evaluate_set_temperature(state: &ChamberState, limits: &Thresholds, target: f64) -> Decision {
    if !target.is_finite() || target < limits.temp_min || target > limits.temp_max {
        return Decision::Reject(RejectReason::OutOfRange);
    }

    if state.temp_change_count + 1 > limits.effective(limits.temp_change_limit) {
        return Decision::Reject(RejectReason::ThermalSystemProtection);
    }

    let delta = target - state.current_temp;

    // A chamber that has already seen setpoint changes cracks on a jump past
    // the shock rating; refuse rather than silently reshape the request.
    if state.temp_change_count > 0 && delta.abs() > limits.thermal_shock_delta {
        return Decision::Reject(RejectReason::ThermalShockProtection);
    }

    // Larger jumps are admitted one capped step at a time. The cap keeps
    // every admitted step under the shock rating with margin to spare.
    if delta.abs() > limits.rapid_step_cap {
        let capped = state.current_temp + limits.rapid_step_cap.copysign(delta);
        return Decision::Admit {
            throttled_target: Some(capped),
        };
    }

    Decision::admit()
}

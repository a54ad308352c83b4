//! Wire codec for the chamber's line protocol.
//!
//! Outgoing commands are newline-terminated ASCII, `VERB` or `VERB ARG`.
//! Each command yields exactly one JSON response line: success replies carry
//! `{"status":"OK", ...fields}`, failures carry
//! `{"error": CODE, "message": text}`. Anything else is a protocol error and
//! is surfaced as such, never coerced to a default value.

use crate::error::{GuardError, GuardResult};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// The closed set of operations the proxy exposes.
///
/// Each variant carries only the parameters the wire command needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    GetStatus,
    OpenDoor,
    CloseDoor,
    SetTemperature(f64),
    StartCycle,
    StopCycle,
    EmergencyStop,
    Calibrate,
    Reset,
    GetTemperature,
    MaintenanceMode,
}

impl Operation {
    /// Wire command line for this operation, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Operation::GetStatus => "STATUS".to_string(),
            Operation::OpenDoor => "OPEN_DOOR".to_string(),
            Operation::CloseDoor => "CLOSE_DOOR".to_string(),
            Operation::SetTemperature(t) => format!("SET_TEMP {}", t),
            Operation::StartCycle => "START_CYCLE".to_string(),
            Operation::StopCycle => "STOP_CYCLE".to_string(),
            Operation::EmergencyStop => "EMERGENCY_STOP".to_string(),
            Operation::Calibrate => "CALIBRATE".to_string(),
            Operation::Reset => "RESET".to_string(),
            Operation::GetTemperature => "GET_TEMP".to_string(),
            Operation::MaintenanceMode => "MAINTENANCE_MODE".to_string(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetStatus => "GetStatus",
            Operation::OpenDoor => "OpenDoor",
            Operation::CloseDoor => "CloseDoor",
            Operation::SetTemperature(_) => "SetTemperature",
            Operation::StartCycle => "StartCycle",
            Operation::StopCycle => "StopCycle",
            Operation::EmergencyStop => "EmergencyStop",
            Operation::Calibrate => "Calibrate",
            Operation::Reset => "Reset",
            Operation::GetTemperature => "GetTemperature",
            Operation::MaintenanceMode => "MaintenanceMode",
        }
    }

    /// Operations that only read device state and wear nothing out.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Operation::GetStatus | Operation::GetTemperature)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fields a success reply may carry. All optional; most commands echo only
/// the handful relevant to them, `STATUS` echoes everything.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ReplyFields {
    pub door_open: Option<bool>,
    pub current_temp: Option<f64>,
    pub target_temp: Option<f64>,
    pub cycle_running: Option<bool>,
    pub emergency_stopped: Option<bool>,
    pub maintenance_mode: Option<bool>,
    pub broken: Option<bool>,
    pub door_cycles: Option<u64>,
    pub temp_changes: Option<u64>,
    pub stop_cycles: Option<u64>,
    pub emergency_stops: Option<u64>,
    pub door_open_calibrations: Option<u64>,
}

/// One decoded device response line.
#[derive(Clone, Debug)]
pub enum DeviceReply {
    /// `{"status":"OK", ...}`
    Ok(ReplyFields),
    /// `{"error": CODE, "message": text}`
    Err { code: String, message: String },
}

impl DeviceReply {
    /// Whether an error reply indicates permanent hardware damage.
    pub fn is_terminal(&self) -> bool {
        match self {
            DeviceReply::Ok(_) => false,
            DeviceReply::Err { code, .. } => is_terminal_code(code),
        }
    }
}

/// Whether a device error code indicates permanent hardware damage.
///
/// The device marks terminal failures with `*_FAILED` / `*_DAMAGE` codes,
/// or reports `DEVICE_BROKEN` once already dead.
pub fn is_terminal_code(code: &str) -> bool {
    code.ends_with("_FAILED") || code.ends_with("_DAMAGE") || code == "DEVICE_BROKEN"
}

/// Decodes a single response line from the device.
pub fn decode_reply(line: &str) -> GuardResult<DeviceReply> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| GuardError::Protocol(format!("invalid JSON: {} (line: {:?})", e, line)))?;

    let obj = value
        .as_object()
        .ok_or_else(|| GuardError::Protocol(format!("response is not an object: {:?}", line)))?;

    if let Some(code) = obj.get("error") {
        let code = code
            .as_str()
            .ok_or_else(|| GuardError::Protocol(format!("non-string error code: {:?}", line)))?
            .to_string();
        let message = obj
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        return Ok(DeviceReply::Err { code, message });
    }

    match obj.get("status").and_then(|s| s.as_str()) {
        Some("OK") => {
            let fields: ReplyFields = serde_json::from_value(value.clone()).map_err(|e| {
                GuardError::Protocol(format!("unexpected field shape: {} (line: {:?})", e, line))
            })?;
            Ok(DeviceReply::Ok(fields))
        }
        Some(other) => Err(GuardError::Protocol(format!(
            "unexpected status {:?} in response",
            other
        ))),
        None => Err(GuardError::Protocol(format!(
            "response carries neither status nor error: {:?}",
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_bare_commands() {
        assert_eq!(Operation::GetStatus.encode(), "STATUS");
        assert_eq!(Operation::OpenDoor.encode(), "OPEN_DOOR");
        assert_eq!(Operation::CloseDoor.encode(), "CLOSE_DOOR");
        assert_eq!(Operation::StartCycle.encode(), "START_CYCLE");
        assert_eq!(Operation::StopCycle.encode(), "STOP_CYCLE");
        assert_eq!(Operation::EmergencyStop.encode(), "EMERGENCY_STOP");
        assert_eq!(Operation::Calibrate.encode(), "CALIBRATE");
        assert_eq!(Operation::Reset.encode(), "RESET");
        assert_eq!(Operation::GetTemperature.encode(), "GET_TEMP");
        assert_eq!(Operation::MaintenanceMode.encode(), "MAINTENANCE_MODE");
    }

    #[test]
    fn test_encode_set_temp_argument() {
        assert_eq!(Operation::SetTemperature(95.5).encode(), "SET_TEMP 95.5");
        assert_eq!(Operation::SetTemperature(-20.0).encode(), "SET_TEMP -20");
    }

    #[test]
    fn test_decode_ok_with_counters() {
        let line = r#"{"status":"OK","door_open":true,"door_cycles":4}"#;
        match decode_reply(line) {
            Ok(DeviceReply::Ok(fields)) => {
                assert_eq!(fields.door_open, Some(true));
                assert_eq!(fields.door_cycles, Some(4));
                assert_eq!(fields.temp_changes, None);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_reply() {
        let line = r#"{"error":"DOOR_OPEN","message":"close the door first"}"#;
        match decode_reply(line) {
            Ok(DeviceReply::Err { code, message }) => {
                assert_eq!(code, "DOOR_OPEN");
                assert_eq!(message, "close the door first");
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_error_detection() {
        let damage = DeviceReply::Err {
            code: "DOOR_MECHANISM_DAMAGE".to_string(),
            message: String::new(),
        };
        assert!(damage.is_terminal());

        let failed = DeviceReply::Err {
            code: "THERMAL_SYSTEM_FAILED".to_string(),
            message: String::new(),
        };
        assert!(failed.is_terminal());

        let already_dead = DeviceReply::Err {
            code: "DEVICE_BROKEN".to_string(),
            message: String::new(),
        };
        assert!(already_dead.is_terminal());

        let transient = DeviceReply::Err {
            code: "DOOR_OPEN".to_string(),
            message: String::new(),
        };
        assert!(!transient.is_terminal());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode_reply("not json at all").unwrap_err();
        assert!(matches!(err, GuardError::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_unexpected_shape() {
        let err = decode_reply(r#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, GuardError::Protocol(_)));

        let err = decode_reply(r#"{"status":"MAYBE"}"#).unwrap_err();
        assert!(matches!(err, GuardError::Protocol(_)));

        let err = decode_reply(r#"{"foo":1}"#).unwrap_err();
        assert!(matches!(err, GuardError::Protocol(_)));
    }
}

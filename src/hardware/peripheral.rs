//! Peripheral-board command blocks.
//!
//! Both unit operations and workflow nodes carry a flat map such as
//! `{"base0_temp": 30, "pump1_ml": 2.5, "ultrasonic0_ms": 500}`. Keys encode the
//! command and its channel; unknown keys are logged and ignored.

use crate::core::JsonMap;
use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::PeripheralBoard;
use crate::parameters::units::parse_number;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[allow(clippy::expect_used)]
static COMMAND_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(base|temp|pump|ultrasonic)(\d{1,2})(?:_(temp|ml|ms))?$")
        .expect("Peripheral key pattern must compile")
});

/// One command for the peripheral board.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum PeripheralCommand {
    SetTemperature { channel: u8, celsius: f64 },
    Dispense { channel: u8, ml: f64 },
    RunTimer { channel: u8, ms: f64 },
}

impl PeripheralCommand {
    /// Interprets one key/value pair; `None` for keys that name no command.
    pub fn from_key(key: &str, value: &serde_json::Value) -> AppResult<Option<Self>> {
        let Some(caps) = COMMAND_KEY.captures(key) else {
            return Ok(None);
        };
        let channel: u8 = caps[2]
            .parse()
            .map_err(|_| EchemError::parse(key, "channel out of range"))?;
        let suffix = caps.get(3).map(|m| m.as_str());
        let command = match (&caps[1], suffix) {
            ("base", Some("temp")) | ("temp", None) => Self::SetTemperature {
                channel,
                celsius: parse_number(key, value)?,
            },
            ("pump", Some("ml")) => Self::Dispense {
                channel,
                ml: parse_number(key, value)?,
            },
            ("ultrasonic", Some("ms")) => Self::RunTimer {
                channel,
                ms: parse_number(key, value)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(command))
    }

    /// Sends the command to `board`.
    pub async fn execute(&self, board: &dyn PeripheralBoard) -> AppResult<()> {
        match *self {
            Self::SetTemperature { channel, celsius } => {
                info!(channel, celsius, "Setting base temperature");
                board.set_temperature(channel, celsius).await
            }
            Self::Dispense { channel, ml } => {
                info!(channel, ml, "Dispensing from pump");
                board.dispense(channel, ml).await
            }
            Self::RunTimer { channel, ms } => {
                info!(channel, ms, "Running ultrasonic timer");
                board.run_timer(channel, ms.max(0.0).round() as u64).await
            }
        }
    }

    /// True for commands that would do nothing on the board.
    pub fn is_noop(&self) -> bool {
        match *self {
            Self::SetTemperature { .. } => false,
            Self::Dispense { ml, .. } => ml <= 0.0,
            Self::RunTimer { ms, .. } => ms <= 0.0,
        }
    }
}

/// Parses a control block. Malformed values fail; unknown keys are skipped.
pub fn parse_peripheral_block(block: &JsonMap) -> AppResult<Vec<PeripheralCommand>> {
    let mut commands = Vec::with_capacity(block.len());
    for (key, value) in block {
        match PeripheralCommand::from_key(key, value)? {
            Some(command) => commands.push(command),
            None => warn!(key = %key, "Unknown peripheral control key, ignoring"),
        }
    }
    Ok(commands)
}

/// Runs every command in order, continuing past individual failures.
/// Zero or negative pump volumes and timer durations are skipped.
///
/// Returns the errors that occurred, in command order.
pub async fn execute_batch(
    board: &dyn PeripheralBoard,
    commands: &[PeripheralCommand],
) -> Vec<EchemError> {
    let mut failures = Vec::new();
    for command in commands {
        if command.is_noop() {
            debug!(?command, "Skipping no-op peripheral command");
            continue;
        }
        if let Err(err) = command.execute(board).await {
            error!(?command, error = %err, "Peripheral command failed, continuing");
            failures.push(err);
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{BoardCall, MockBoard};
    use serde_json::json;

    fn block(value: serde_json::Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_forms() {
        let commands = parse_peripheral_block(&block(json!({
            "base0_temp": 30,
            "temp1": "25.5",
            "pump2_ml": 1.5,
            "ultrasonic0_ms": 500,
            "stirrer0_rpm": 100
        })))
        .unwrap();
        assert_eq!(commands.len(), 4);
        assert!(commands.contains(&PeripheralCommand::SetTemperature {
            channel: 1,
            celsius: 25.5
        }));
        assert!(commands.contains(&PeripheralCommand::Dispense {
            channel: 2,
            ml: 1.5
        }));
    }

    #[test]
    fn test_bad_value_names_key() {
        let err = parse_peripheral_block(&block(json!({"pump0_ml": "lots"}))).unwrap_err();
        assert!(err.to_string().contains("pump0_ml"));
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let board = MockBoard::new();
        board.fail_channel(1).await;
        let commands = vec![
            PeripheralCommand::Dispense { channel: 1, ml: 2.0 },
            PeripheralCommand::RunTimer { channel: 0, ms: 250.0 },
        ];
        let failures = execute_batch(&board, &commands).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(
            board.calls().await,
            vec![BoardCall::RunTimer { channel: 0, ms: 250 }]
        );
    }

    #[tokio::test]
    async fn test_batch_skips_empty_pumps_and_timers() {
        let board = MockBoard::new();
        let commands = parse_peripheral_block(&block(json!({
            "pump0_ml": 0,
            "pump1_ml": -1.0,
            "ultrasonic0_ms": 0,
            "base0_temp": 0,
            "pump2_ml": 0.5
        })))
        .unwrap();
        assert_eq!(commands.len(), 5);

        let failures = execute_batch(&board, &commands).await;
        assert!(failures.is_empty());
        let calls = board.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&BoardCall::SetTemperature {
            channel: 0,
            celsius: 0.0
        }));
        assert!(calls.contains(&BoardCall::Dispense { channel: 2, ml: 0.5 }));
    }
}

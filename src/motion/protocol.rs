//! Line-oriented G-code command set spoken by serial motion controllers
//!
//! Every command is one ASCII line terminated by `\n`. The controller answers
//! with zero or more informational lines followed by a line equal to, or
//! starting with, `ok` (any case).

use std::time::Duration;

use crate::types::{AxisTargets, Position3D};

/// Select absolute positioning. Issued on connect; never moves an axis.
pub const ABSOLUTE_POSITIONING: &str = "G90";
pub const HOME_ALL_AXES: &str = "G28";
pub const EMERGENCY_STOP: &str = "M112";
pub const REPORT_POSITION: &str = "M114";

pub const STATUS_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);
pub const MOTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const HOME_TIMEOUT: Duration = Duration::from_secs(60);

/// Encode an absolute linear move
///
/// Returns `None` when no axis is targeted; such a move must not reach the wire.
pub fn encode_move(targets: &AxisTargets) -> Option<String> {
    if targets.is_empty() {
        return None;
    }

    let mut command = String::from("G1");
    for (letter, value) in [('X', targets.x), ('Y', targets.y), ('Z', targets.z)] {
        if let Some(value) = value {
            command.push(' ');
            command.push(letter);
            command.push_str(&format_number(value));
        }
    }
    if let Some(feed_rate) = targets.feed_rate {
        command.push_str(" F");
        command.push_str(&format_number(feed_rate));
    }
    Some(command)
}

/// Fixed four-decimal rendering with trailing zeros removed
pub fn format_number(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "" | "-" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

/// True for the line that terminates a response
pub fn is_ack(line: &str) -> bool {
    line.trim().to_ascii_lowercase().starts_with("ok")
}

/// True for lines reporting a controller-side error
pub fn is_error(line: &str) -> bool {
    let lower = line.trim().to_ascii_lowercase();
    lower.starts_with("error") || lower.starts_with("!!")
}

/// Parse an `M114` report such as `X:1.00 Y:2.00 Z:0.30 E:0.00 Count ...`
///
/// Only the first occurrence of each axis is used; firmware appends stepper
/// counts with the same letters later in the line.
pub fn parse_position_report(line: &str) -> Option<Position3D> {
    let mut x = None;
    let mut y = None;
    let mut z = None;

    for token in line.split_whitespace() {
        let Some((axis, value)) = token.split_once(':') else {
            continue;
        };
        let slot = match axis {
            "X" => &mut x,
            "Y" => &mut y,
            "Z" => &mut z,
            _ => continue,
        };
        if slot.is_none() {
            *slot = value.parse::<f64>().ok();
        }
    }

    Some(Position3D::new(x?, y?, z?))
}

/// Parse a signal reading: the first numeric token of a line, optionally
/// prefixed by a `NAME:` label
pub fn parse_signal(line: &str) -> Option<f64> {
    line.split_whitespace().find_map(|token| {
        let value = token.rsplit(':').next().unwrap_or(token);
        value.parse::<f64>().ok().filter(|v| v.is_finite())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_full_move() {
        let targets = AxisTargets::new()
            .with_x(2.5)
            .with_y(0.0)
            .with_z(-0.125)
            .with_feed_rate(Some(1200.0));
        assert_eq!(
            encode_move(&targets).as_deref(),
            Some("G1 X2.5 Y0 Z-0.125 F1200")
        );
    }

    #[test]
    fn test_encode_sparse_move() {
        assert_eq!(encode_move(&AxisTargets::z(0.3)).as_deref(), Some("G1 Z0.3"));
    }

    #[test]
    fn test_encode_empty_move_is_none() {
        assert_eq!(encode_move(&AxisTargets::new()), None);
        // Feed rate alone is not a move
        assert_eq!(
            encode_move(&AxisTargets::new().with_feed_rate(Some(300.0))),
            None
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(1.23456), "1.2346");
        assert_eq!(format_number(-0.00001), "0");
        assert_eq!(format_number(7.5), "7.5");
    }

    #[test]
    fn test_ack_detection() {
        assert!(is_ack("ok"));
        assert!(is_ack("OK"));
        assert!(is_ack("ok T:21.0 /0.0"));
        assert!(!is_ack("echo:busy processing"));
        assert!(!is_ack(""));
    }

    #[test]
    fn test_error_detection() {
        assert!(is_error("Error:Printer halted"));
        assert!(is_error("!! kill"));
        assert!(!is_error("ok"));
    }

    #[test]
    fn test_parse_position_report() {
        let position =
            parse_position_report("X:1.00 Y:2.50 Z:0.30 E:0.00 Count X:100 Y:250 Z:30").unwrap();
        assert_eq!(position, Position3D::new(1.0, 2.5, 0.3));
    }

    #[test]
    fn test_parse_position_report_incomplete() {
        assert_eq!(parse_position_report("X:1.00 Y:2.50"), None);
        assert_eq!(parse_position_report("ok"), None);
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("0.8125"), Some(0.8125));
        assert_eq!(parse_signal("SIG:1.5"), Some(1.5));
        assert_eq!(parse_signal("ok"), None);
    }
}

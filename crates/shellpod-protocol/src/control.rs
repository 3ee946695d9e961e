//! Terminal stream control frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normal closure code (RFC 6455 §7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;

/// Structured control message carried in a text frame.
///
/// Everything that is not a control frame is raw terminal bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Terminal geometry change.
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Error)]
pub enum ControlFrameError {
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("terminal geometry must be non-zero (got {cols}x{rows})")]
    ZeroGeometry { cols: u16, rows: u16 },
}

impl ControlFrame {
    pub fn resize(cols: u16, rows: u16) -> Self {
        Self::Resize { cols, rows }
    }

    /// Parse and validate a control frame received as text.
    pub fn parse(text: &str) -> Result<Self, ControlFrameError> {
        let frame: ControlFrame = serde_json::from_str(text)?;
        match frame {
            ControlFrame::Resize { cols, rows } if cols == 0 || rows == 0 => {
                Err(ControlFrameError::ZeroGeometry { cols, rows })
            }
            frame => Ok(frame),
        }
    }

    pub fn to_json(&self) -> String {
        // A two-field enum variant always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// How a terminal client should treat a socket closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Intentional close; never retried.
    Clean,
    /// Dropped connection, server crash, missing close frame.
    Abnormal,
}

/// Only a normal closure counts as clean. A missing close frame is abnormal.
pub fn classify_close_code(code: Option<u16>) -> CloseKind {
    match code {
        Some(CLOSE_NORMAL) => CloseKind::Clean,
        _ => CloseKind::Abnormal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frame_uses_tagged_wire_format() {
        let json = ControlFrame::resize(120, 40).to_json();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);
    }

    #[test]
    fn parse_rejects_unknown_types_and_zero_geometry() {
        assert!(matches!(
            ControlFrame::parse(r#"{"type":"paste","data":"x"}"#),
            Err(ControlFrameError::Malformed(_))
        ));
        assert!(matches!(
            ControlFrame::parse(r#"{"type":"resize","cols":0,"rows":24}"#),
            Err(ControlFrameError::ZeroGeometry { cols: 0, rows: 24 })
        ));
        assert_eq!(
            ControlFrame::parse(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap(),
            ControlFrame::resize(80, 24)
        );
    }

    #[test]
    fn only_normal_closure_is_clean() {
        assert_eq!(classify_close_code(Some(1000)), CloseKind::Clean);
        assert_eq!(classify_close_code(Some(1006)), CloseKind::Abnormal);
        assert_eq!(classify_close_code(Some(1011)), CloseKind::Abnormal);
        assert_eq!(classify_close_code(None), CloseKind::Abnormal);
    }
}

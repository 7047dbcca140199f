//! Control channel messages.
//!
//! # Wire Protocol
//!
//! ```text
//! Viewer ──{"type":"auth","token":"..."}────────────────────► Host
//! Viewer ──{"type":"mouse","action":"down","x":10,"y":20,...}► Host
//! Viewer ──{"type":"rpc","name":"ping","reqId":1,...}───────► Host
//! Viewer ◄─{"type":"rpcResult","name":"ping","reqId":1,...}── Host
//! Viewer ◄─{"type":"redirect","roomId":"room:..."}────────── Host
//! ```

use serde::{Deserialize, Serialize};

use crate::error::PeerError;

// ── Mouse Input ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    Down,
    Up,
    Click,
    DblClick,
    Wheel,
}

/// Mouse event in the host's screen coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MouseEvent {
    pub action: MouseAction,
    pub x: f64,
    pub y: f64,
    /// 0 = primary, 1 = middle, 2 = secondary.
    #[serde(default)]
    pub button: u8,
}

impl MouseEvent {
    pub fn move_to(x: f64, y: f64) -> Self {
        Self {
            action: MouseAction::Move,
            x,
            y,
            button: 0,
        }
    }

    pub fn press(x: f64, y: f64, button: u8) -> Self {
        Self {
            action: MouseAction::Down,
            x,
            y,
            button,
        }
    }

    pub fn release(x: f64, y: f64, button: u8) -> Self {
        Self {
            action: MouseAction::Up,
            x,
            y,
            button,
        }
    }
}

// ── Keyboard Input ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Down,
    Up,
    Press,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Shift,
    Ctrl,
    Alt,
    Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyEvent {
    pub action: KeyAction,
    /// Key name, e.g. `"a"`, `"Enter"`, `"ArrowLeft"`.
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

impl KeyEvent {
    pub fn press(key: impl Into<String>, modifiers: Vec<Modifier>) -> Self {
        Self {
            action: KeyAction::Press,
            key: key.into(),
            modifiers,
        }
    }
}

// ── ControlMessage ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    Auth {
        token: String,
    },
    Redirect {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    Mouse(MouseEvent),
    Key(KeyEvent),
    Rpc {
        name: String,
        #[serde(rename = "reqId")]
        req_id: u32,
        #[serde(default)]
        params: serde_json::Value,
    },
    RpcResult {
        name: String,
        #[serde(rename = "reqId")]
        req_id: u32,
        #[serde(default)]
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, PeerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, PeerError> {
        Ok(serde_json::from_str(raw)?)
    }
}

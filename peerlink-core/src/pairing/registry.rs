//! Paired device records.
//!
//! The registry is an explicit object handed to whoever needs it. With a
//! backing file it rewrites the whole JSON document after every change.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PeerError;
use crate::sync::MutexExt;

/// Long-lived credentials for one paired peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_room_id: Option<String>,
    pub signaling_key: String,
    pub user_agent: String,
    pub token: String,
}

impl DeviceRecord {
    /// Base room for stream sessions of this device.
    pub fn stream_base(&self) -> &str {
        self.publish_room_id.as_deref().unwrap_or(&self.room_id)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.user_agent)
    }
}

#[derive(Default)]
struct RegistryState {
    devices: Vec<DeviceRecord>,
    path: Option<PathBuf>,
}

/// Cloneable handle to the set of paired devices, keyed by `room_id`.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl DeviceRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty registry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PeerError> {
        let path = path.as_ref().to_path_buf();
        let devices = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "loaded device registry");
        Ok(Self {
            state: Arc::new(Mutex::new(RegistryState {
                devices,
                path: Some(path),
            })),
        })
    }

    /// Insert or replace the record with the same `room_id`.
    pub fn upsert(&self, record: DeviceRecord) -> Result<(), PeerError> {
        let mut state = self.state.locked();
        match state.devices.iter_mut().find(|d| d.room_id == record.room_id) {
            Some(existing) => *existing = record,
            None => {
                info!(room = %record.room_id, agent = %record.user_agent, "device paired");
                state.devices.push(record);
            }
        }
        save(&state)
    }

    pub fn remove(&self, room_id: &str) -> Result<Option<DeviceRecord>, PeerError> {
        let mut state = self.state.locked();
        let Some(idx) = state.devices.iter().position(|d| d.room_id == room_id) else {
            return Ok(None);
        };
        let removed = state.devices.remove(idx);
        save(&state)?;
        Ok(Some(removed))
    }

    pub fn get(&self, room_id: &str) -> Option<DeviceRecord> {
        self.state
            .locked()
            .devices
            .iter()
            .find(|d| d.room_id == room_id)
            .cloned()
    }

    pub fn find_by_token(&self, token: &str) -> Option<DeviceRecord> {
        self.state
            .locked()
            .devices
            .iter()
            .find(|d| d.token == token)
            .cloned()
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.state.locked().devices.clone()
    }

    pub fn len(&self) -> usize {
        self.state.locked().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn save(state: &RegistryState) -> Result<(), PeerError> {
    let Some(path) = &state.path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(&state.devices)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

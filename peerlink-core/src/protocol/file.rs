//! File protocol messages.
//!
//! # Wire Protocol
//!
//! ```text
//! Client ──{"rid":7,"op":"stat","path":"/a"}──────────────────► Server
//! Client ◄─{"rid":7,"data":{"type":"file","name":"a",...}}──── Server
//!
//! Client ──{"rid":8,"op":"read","path":"/a","p":0,"l":32768}──► Server
//! Client ◄─[0 0 0 0][8 0 0 0][payload ...]──────────────────── Server (binary)
//!
//! Client ──{"rid":9,"op":"remove","path":"/ro"}───────────────► Server
//! Client ◄─{"rid":9,"error":"read_only"}────────────────────── Server
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ErrorCode, PeerError};
use crate::router::Reply;

/// Sub-channel name the file protocol runs on.
pub const FILES_CHANNEL: &str = "files";

/// Directory prefix for synthesized thumbnail paths.
pub const THUMBNAIL_PREFIX: &str = "/.thumbnail";

// ── Requests ─────────────────────────────────────────────────────

/// One request on the wire: a request id plus the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCommand {
    pub rid: u32,
    #[serde(flatten)]
    pub op: FileOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOp {
    Stat {
        path: String,
    },
    Files {
        path: String,
        #[serde(rename = "p", default)]
        offset: u64,
        /// Negative means unbounded.
        #[serde(rename = "l", default = "unbounded")]
        limit: i64,
    },
    Read {
        path: String,
        #[serde(rename = "p", default)]
        offset: u64,
        #[serde(rename = "l")]
        length: u64,
    },
    Write {
        path: String,
        #[serde(rename = "p", default)]
        offset: u64,
        #[serde(rename = "b", with = "base64_bytes")]
        data: Vec<u8>,
    },
    Truncate {
        path: String,
        #[serde(rename = "p")]
        size: u64,
    },
    Mkdir {
        path: String,
    },
    Remove {
        path: String,
    },
    Rename {
        path: String,
        path2: String,
    },
}

fn unbounded() -> i64 {
    -1
}

impl FileOp {
    pub fn name(&self) -> &'static str {
        match self {
            FileOp::Stat { .. } => "stat",
            FileOp::Files { .. } => "files",
            FileOp::Read { .. } => "read",
            FileOp::Write { .. } => "write",
            FileOp::Truncate { .. } => "truncate",
            FileOp::Mkdir { .. } => "mkdir",
            FileOp::Remove { .. } => "remove",
            FileOp::Rename { .. } => "rename",
        }
    }

    /// Operations that modify the store.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            FileOp::Write { .. }
                | FileOp::Truncate { .. }
                | FileOp::Mkdir { .. }
                | FileOp::Remove { .. }
                | FileOp::Rename { .. }
        )
    }

    pub fn path(&self) -> &str {
        match self {
            FileOp::Stat { path }
            | FileOp::Files { path, .. }
            | FileOp::Read { path, .. }
            | FileOp::Write { path, .. }
            | FileOp::Truncate { path, .. }
            | FileOp::Mkdir { path }
            | FileOp::Remove { path }
            | FileOp::Rename { path, .. } => path,
        }
    }
}

/// Outcome of parsing an incoming request.
#[derive(Debug)]
pub enum ParsedCommand {
    Command(FileCommand),
    /// Well-formed envelope with an op this side does not implement.
    Unknown { rid: u32, op: String },
}

#[derive(Deserialize)]
struct Envelope {
    rid: u32,
    #[serde(default)]
    op: String,
}

impl FileCommand {
    pub fn to_json(&self) -> Result<String, PeerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a request, separating unknown ops from malformed input.
    pub fn parse(raw: &str) -> Result<ParsedCommand, PeerError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match serde_json::from_value::<FileCommand>(value.clone()) {
            Ok(command) => Ok(ParsedCommand::Command(command)),
            Err(e) => {
                let envelope: Envelope = serde_json::from_value(value)?;
                if KNOWN_OPS.contains(&envelope.op.as_str()) {
                    Err(e.into())
                } else {
                    Ok(ParsedCommand::Unknown {
                        rid: envelope.rid,
                        op: envelope.op,
                    })
                }
            }
        }
    }
}

const KNOWN_OPS: [&str; 8] = [
    "stat", "files", "read", "write", "truncate", "mkdir", "remove", "rename",
];

// ── Replies ──────────────────────────────────────────────────────

/// A JSON reply: `data` on success, `error` otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReply {
    pub rid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileReply {
    pub fn ok(rid: u32, data: serde_json::Value) -> Self {
        Self {
            rid,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(rid: u32, code: ErrorCode) -> Self {
        Self {
            rid,
            data: None,
            error: Some(code.as_str().to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, PeerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_outcome(self) -> Result<Reply, ErrorCode> {
        match self.error {
            Some(code) => Err(ErrorCode::from_wire(&code)),
            None => Ok(Reply::Value(self.data.unwrap_or(serde_json::Value::Null))),
        }
    }
}

// ── Stat records ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatMetadata {
    /// Path that serves a rendered thumbnail of this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// The `stat` reply, and one element of a `files` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub name: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "updatedTime")]
    pub updated_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StatMetadata>,
}

impl StatRecord {
    pub fn thumbnail(&self) -> Option<&str> {
        self.metadata.as_ref()?.thumbnail.as_deref()
    }
}

// ── base64 ───────────────────────────────────────────────────────

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ── Path helpers ─────────────────────────────────────────────────

/// Join a directory path and a child name with exactly one slash.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// The thumbnail reference for `path`.
pub fn thumbnail_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    format!("{THUMBNAIL_PREFIX}/{trimmed}")
}

/// If `path` is a thumbnail reference, the source path it renders.
pub fn thumbnail_source(path: &str) -> Option<String> {
    let rest = path.strip_prefix(THUMBNAIL_PREFIX)?;
    rest.starts_with('/').then(|| rest.to_string())
}

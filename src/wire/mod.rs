//! Jupyter messaging protocol: connection files, message framing and signing.

use std::{fs, path::Path};

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.3";
const DELIMITER: &[u8] = b"<IDS|MSG>";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("cannot read connection file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),

    #[error("message has no <IDS|MSG> delimiter")]
    MissingDelimiter,

    #[error("message has {0} frames after the delimiter, expected at least 5")]
    TooFewFrames(usize),

    #[error("invalid signature")]
    BadSignature,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionInfo {
    pub ip: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: Option<String>,
}

fn default_transport() -> String {
    "tcp".into()
}

fn default_scheme() -> String {
    "hmac-sha256".into()
}

impl ConnectionInfo {
    pub fn from_file(path: &Path) -> Result<Self, WireError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn endpoint(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    pub fn signer(&self) -> Result<Signer, WireError> {
        Signer::new(&self.signature_scheme, &self.key)
    }
}

/// Signs and verifies messages with the connection key.
#[derive(Debug, Clone)]
pub struct Signer {
    key: Option<Vec<u8>>,
}

impl Signer {
    pub fn new(scheme: &str, key: &str) -> Result<Self, WireError> {
        if key.is_empty() {
            return Ok(Self { key: None });
        }
        if scheme != "hmac-sha256" {
            return Err(WireError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self { key: Some(key.as_bytes().to_vec()) })
    }

    fn mac(&self, parts: &[&[u8]]) -> Option<HmacSha256> {
        let key = self.key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        for p in parts {
            mac.update(p);
        }
        Some(mac)
    }

    pub fn sign(&self, parts: &[&[u8]]) -> String {
        self.mac(parts)
            .map(|m| hex::encode(m.finalize().into_bytes()))
            .unwrap_or_default()
    }

    pub fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> bool {
        let Some(mac) = self.mac(parts) else {
            return true;
        };
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        mac.verify_slice(&expected).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(session: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: "kernel".into(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub identities: Vec<Bytes>,
    pub header: Header,
    /// `{}` when the message has no parent.
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Bytes>,
}

impl Message {
    pub fn new(session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(session, msg_type),
            parent_header: json!({}),
            metadata: json!({}),
            content,
            buffers: Vec::new(),
        }
    }

    /// A message caused by `parent`, routed back to the same peer.
    pub fn reply(parent: &Message, session: &str, msg_type: &str, content: Value) -> Self {
        let mut msg = Self::new(session, msg_type, content);
        msg.identities = parent.identities.clone();
        msg.parent_header = serde_json::to_value(&parent.header).unwrap_or_else(|_| json!({}));
        msg
    }

    /// Same as [`Message::reply`] but without routing identities, for iopub.
    pub fn broadcast(parent: Option<&Message>, session: &str, msg_type: &str, content: Value) -> Self {
        match parent {
            Some(p) => {
                let mut msg = Self::reply(p, session, msg_type, content);
                msg.identities.clear();
                msg
            }
            None => Self::new(session, msg_type, content),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn from_frames(frames: Vec<Bytes>, signer: &Signer) -> Result<Self, WireError> {
        let split = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or(WireError::MissingDelimiter)?;
        let mut rest = frames.into_iter();
        let identities: Vec<Bytes> = rest.by_ref().take(split).collect();
        rest.next(); // delimiter
        let body: Vec<Bytes> = rest.collect();
        if body.len() < 5 {
            return Err(WireError::TooFewFrames(body.len()));
        }

        let signed: Vec<&[u8]> = body[1..5].iter().map(|b| b.as_ref()).collect();
        if !signer.verify(&body[0], &signed) {
            return Err(WireError::BadSignature);
        }

        Ok(Self {
            identities,
            header: serde_json::from_slice(&body[1])?,
            parent_header: serde_json::from_slice(&body[2])?,
            metadata: serde_json::from_slice(&body[3])?,
            content: serde_json::from_slice(&body[4])?,
            buffers: body[5..].to_vec(),
        })
    }

    pub fn into_frames(self, signer: &Signer) -> Result<Vec<Bytes>, WireError> {
        let header = serde_json::to_vec(&self.header)?;
        let parent = serde_json::to_vec(&self.parent_header)?;
        let metadata = serde_json::to_vec(&self.metadata)?;
        let content = serde_json::to_vec(&self.content)?;
        let signature = signer.sign(&[
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ]);

        let mut frames = self.identities;
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature));
        frames.push(Bytes::from(header));
        frames.push(Bytes::from(parent));
        frames.push(Bytes::from(metadata));
        frames.push(Bytes::from(content));
        frames.extend(self.buffers);
        Ok(frames)
    }
}

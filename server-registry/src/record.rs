use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::ServerIdentity;
use crate::Error;

/// One process's published entry in the registry hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub hostname: String,
    pub process_id: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(identity: &ServerIdentity, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            server_id: identity.server_id.clone(),
            hostname: identity.hostname.clone(),
            process_id: identity.process_id,
            started_at,
            last_heartbeat: now,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }
}

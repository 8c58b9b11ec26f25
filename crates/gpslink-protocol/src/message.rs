//! Messages sent from this side of the link.

use serde::{Deserialize, Serialize};

/// Default client name announced in the handshake.
pub const DEFAULT_CLIENT_NAME: &str = "NodeNav-PC";

/// Greeting sent once after every successful connect.
///
/// Wire form: `{"type":"client","name":"NodeNav-PC"}\n`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "client")]
pub struct ClientHello {
    pub name: String,
}

impl ClientHello {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Serializes to a newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl Default for ClientHello {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_NAME)
    }
}

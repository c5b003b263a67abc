use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use splash_engine::{SplashEvent, Tier, config::validate_tiers};

/// Messages accepted from WebSocket clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace the live tier set. Episodes already open keep their window.
    UpdateConfig { tiers: Vec<Tier> },
}

/// Messages sent to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        tiers: Vec<Tier>,
        timestamp: DateTime<Utc>,
    },
    ConfigUpdated {
        tiers: Vec<Tier>,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    Splash(SplashEvent),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, String> {
        let message = serde_json::from_str::<Self>(text).map_err(|error| error.to_string())?;

        match &message {
            ClientMessage::UpdateConfig { tiers } => {
                validate_tiers(tiers).map_err(|error| error.to_string())?;
            }
        }

        Ok(message)
    }
}

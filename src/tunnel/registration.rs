use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Identity the desktop shell provisions for this node. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
    pub device_name: String,
    pub gateway_address: String,
    pub reward_address: String,
    pub code: String,
}

/// `<home>/.narval/config/device-registration.json`
pub fn default_registration_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".narval")
            .join("config")
            .join("device-registration.json")
    })
}

pub fn load_registration(path: &PathBuf) -> Result<DeviceRegistration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))
}

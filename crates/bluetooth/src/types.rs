use crate::classify::classify_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceClassification {
    HighlyLikelyElm327,
    PossiblyCompatible,
    Unknown,
}

impl DeviceClassification {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceClassification::HighlyLikelyElm327 => "OBD adapter",
            DeviceClassification::PossiblyCompatible => "Possibly compatible",
            DeviceClassification::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairingStatus {
    Idle,
    Discovering,
    Connecting,
    Testing,
    Success,
    Failed,
}

impl PairingStatus {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PairingStatus::Discovering | PairingStatus::Connecting | PairingStatus::Testing
        )
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PairingStatus::Idle => "Idle",
            PairingStatus::Discovering => "Searching",
            PairingStatus::Connecting => "Connecting",
            PairingStatus::Testing => "Testing",
            PairingStatus::Success => "Connected",
            PairingStatus::Failed => "Failed",
        };
        f.write_str(text)
    }
}

/// A Bluetooth device seen during discovery.
///
/// Identity is the MAC address alone: equality and hashing ignore every
/// other field, so the same adapter seen twice with a different RSSI is
/// still one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub mac_address: String,
    pub name: String,
    pub signal_strength: Option<i16>,
    pub device_type: String,
    pub last_seen: DateTime<Utc>,
    pub is_paired: bool,
    pub connection_verified: bool,
    pub device_classification: DeviceClassification,
}

impl BluetoothDevice {
    /// Builds a freshly seen device, classifying it from its name.
    pub fn new(mac_address: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let (device_classification, device_type) = classify_name(&name);
        Self {
            mac_address: mac_address.into().to_ascii_uppercase(),
            name,
            signal_strength: None,
            device_type: device_type.to_string(),
            last_seen: Utc::now(),
            is_paired: false,
            connection_verified: false,
            device_classification,
        }
    }

    pub fn with_signal_strength(mut self, rssi: i16) -> Self {
        self.signal_strength = Some(rssi);
        self
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.mac_address
        } else {
            &self.name
        }
    }

    pub fn is_likely_obd(&self) -> bool {
        self.device_classification == DeviceClassification::HighlyLikelyElm327
    }
}

impl PartialEq for BluetoothDevice {
    fn eq(&self, other: &Self) -> bool {
        self.mac_address == other.mac_address
    }
}

impl Eq for BluetoothDevice {}

impl Hash for BluetoothDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mac_address.hash(state);
    }
}

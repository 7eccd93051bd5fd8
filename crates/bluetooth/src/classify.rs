use crate::types::{BluetoothDevice, DeviceClassification};
use std::cmp::Reverse;

const ELM327_PATTERNS: &[&str] = &[
    "OBD", "ELM", "VLINK", "V-LINK", "VGATE", "ICAR", "KONNWEI", "VEEPEAK", "OBDLINK",
    "BAFX", "CARISTA", "KIWI",
];

const SERIAL_PATTERNS: &[&str] = &[
    "SPP", "SERIAL", "HC-05", "HC-06", "CAR", "AUTO", "SCAN", "DIAG", "BT-",
];

/// Classifies a device from its advertised name, returning the
/// classification and a short device type label.
pub fn classify_name(name: &str) -> (DeviceClassification, &'static str) {
    let upper = name.to_ascii_uppercase();

    if ELM327_PATTERNS.iter().any(|p| upper.contains(p)) {
        (DeviceClassification::HighlyLikelyElm327, "elm327")
    } else if SERIAL_PATTERNS.iter().any(|p| upper.contains(p)) {
        (DeviceClassification::PossiblyCompatible, "serial")
    } else {
        (DeviceClassification::Unknown, "other")
    }
}

pub fn is_candidate(device: &BluetoothDevice, show_all_devices: bool) -> bool {
    show_all_devices || device.device_classification != DeviceClassification::Unknown
}

/// Most likely adapters first, then by signal strength.
pub fn sort_devices(devices: &mut [BluetoothDevice]) {
    devices.sort_by_key(|d| {
        (
            d.device_classification,
            Reverse(d.signal_strength.unwrap_or(i16::MIN)),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_common_adapters() {
        for name in ["OBDII", "OBD2 Scanner", "vLink", "Vgate iCar Pro", "ELM327 v1.5"] {
            assert_eq!(
                classify_name(name).0,
                DeviceClassification::HighlyLikelyElm327,
                "{name}"
            );
        }
    }

    #[test]
    fn generic_serial_modules_are_possible() {
        assert_eq!(
            classify_name("HC-05").0,
            DeviceClassification::PossiblyCompatible
        );
        assert_eq!(classify_name("Pixel 7").0, DeviceClassification::Unknown);
    }

    #[test]
    fn unknown_devices_hidden_unless_show_all() {
        let phone = BluetoothDevice::new("11:22:33:44:55:66", "Pixel 7");
        assert!(!is_candidate(&phone, false));
        assert!(is_candidate(&phone, true));
    }

    #[test]
    fn sorts_by_classification_then_signal() {
        let mut devices = vec![
            BluetoothDevice::new("00:00:00:00:00:01", "HC-05").with_signal_strength(-30),
            BluetoothDevice::new("00:00:00:00:00:02", "OBDII").with_signal_strength(-80),
            BluetoothDevice::new("00:00:00:00:00:03", "OBDII").with_signal_strength(-50),
            BluetoothDevice::new("00:00:00:00:00:04", "Speaker"),
        ];
        sort_devices(&mut devices);
        let order: Vec<_> = devices.iter().map(|d| &d.mac_address[15..]).collect();
        assert_eq!(order, vec!["03", "02", "01", "04"]);
    }
}

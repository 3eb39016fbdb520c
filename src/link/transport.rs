//! Seam to the platform BLE stack. The link only needs scan, connect,
//! subscribe, read, write and disconnect; notifications and disconnect
//! callbacks arrive on the signal channel returned by `connect`.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::LinkResult;
use crate::protocol::{DEVICE_NAME_FILTER, SERVICE_UUID};
use crate::types::Channel;

/// One advertising device seen during a scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<String>,
}

/// Pushed by the platform stack while a link is up.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportSignal {
    Notification { channel: Channel, bytes: Vec<u8> },
    Disconnected,
}

#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn scan(&self, timeout: Duration) -> LinkResult<Vec<Advertisement>>;

    /// Open a link. The returned receiver yields notifications for subscribed
    /// channels and a `Disconnected` signal if the peer drops.
    async fn connect(&self, address: &str) -> LinkResult<UnboundedReceiver<TransportSignal>>;

    async fn subscribe(&self, channel: Channel) -> LinkResult<()>;

    async fn read(&self, channel: Channel) -> LinkResult<Vec<u8>>;

    async fn write_command(&self, payload: &[u8]) -> LinkResult<()>;

    async fn disconnect(&self) -> LinkResult<()>;

    fn is_connected(&self) -> bool;
}

fn is_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return false;
    }
    // Separators must be consistent, like 00:11:22:33:44:55 or 00-11-22-33-44-55
    let sep_ok = !(value.contains(':') && value.contains('-'));
    sep_ok
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// True if a device hint should be used as an address directly instead of
/// being matched against advertised names.
pub fn looks_like_address(hint: &str) -> bool {
    let v = hint.trim();
    if is_mac(v) {
        return true;
    }
    if v.len() >= 16 && v.contains(':') {
        return true;
    }
    // Some platforms expose addresses as GUIDs
    v.len() >= 32
        && v.matches('-').count() >= 2
        && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// First advertisement matching the name hint, the device name filter, or
/// the telemetry service UUID.
pub fn select_device(advertisements: &[Advertisement], name_hint: Option<&str>) -> Option<String> {
    let hint = name_hint
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty());
    let filter = DEVICE_NAME_FILTER.to_lowercase();
    let service = SERVICE_UUID.to_lowercase();

    advertisements
        .iter()
        .filter(|ad| !ad.address.is_empty())
        .find(|ad| {
            let name = ad.name.as_deref().unwrap_or_default().to_lowercase();
            hint.as_deref().map_or(false, |h| name.contains(h))
                || name.contains(&filter)
                || ad.service_uuids.iter().any(|u| u.to_lowercase() == service)
        })
        .map(|ad| ad.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(name: Option<&str>, address: &str, uuids: &[&str]) -> Advertisement {
        Advertisement {
            name: name.map(str::to_string),
            address: address.to_string(),
            rssi: Some(-60),
            service_uuids: uuids.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_address_like_hints() {
        assert!(looks_like_address("CF:44:65:7D:2F:CE"));
        assert!(looks_like_address(" cf-44-65-7d-2f-ce "));
        assert!(looks_like_address("0123456789ABCDEF:01"));
        assert!(looks_like_address("6b2f4a3c-9d1e-4f7a-8b3c-2d1e0f9a8b7c"));
        assert!(!looks_like_address("Atlas 2"));
        assert!(!looks_like_address("CF:44:65:7D:2F"));
    }

    #[test]
    fn test_select_device_by_name_filter() {
        let ads = vec![
            ad(Some("Phone"), "11:11:11:11:11:11", &[]),
            ad(Some("ATLAS 2 #123"), "22:22:22:22:22:22", &[]),
        ];
        assert_eq!(select_device(&ads, None).as_deref(), Some("22:22:22:22:22:22"));
    }

    #[test]
    fn test_select_device_by_service_uuid() {
        let ads = vec![
            ad(None, "11:11:11:11:11:11", &[]),
            ad(None, "33:33:33:33:33:33", &[&SERVICE_UUID.to_uppercase()]),
        ];
        assert_eq!(select_device(&ads, None).as_deref(), Some("33:33:33:33:33:33"));
    }

    #[test]
    fn test_select_device_by_name_hint() {
        let ads = vec![ad(Some("Committee Boat Unit"), "44:44:44:44:44:44", &[])];
        assert_eq!(
            select_device(&ads, Some("committee")).as_deref(),
            Some("44:44:44:44:44:44")
        );
        assert_eq!(select_device(&ads, None), None);
    }

    #[test]
    fn test_select_device_skips_missing_address() {
        let ads = vec![ad(Some("Atlas"), "", &[])];
        assert_eq!(select_device(&ads, None), None);
    }
}

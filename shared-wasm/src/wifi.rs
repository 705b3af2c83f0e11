//! WiFi network descriptions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One access point as reported by a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Signal quality, 0-100
    pub signal: u8,
    /// Security description (e.g. "WPA2"); empty for open networks
    #[serde(default)]
    pub security: String,
}

impl WifiNetwork {
    /// True when connecting needs no password.
    pub fn is_open(&self) -> bool {
        let s = self.security.trim();
        s.is_empty() || s == "--" || s.eq_ignore_ascii_case("none")
    }
}

/// Merge scan entries that share an SSID, keeping the strongest one.
///
/// Hidden networks (empty SSID) are dropped. The result is sorted by signal,
/// strongest first, with SSID as tie-breaker.
pub fn dedup_networks(networks: impl IntoIterator<Item = WifiNetwork>) -> Vec<WifiNetwork> {
    let mut best: HashMap<String, WifiNetwork> = HashMap::new();
    for network in networks {
        if network.ssid.trim().is_empty() {
            continue;
        }
        match best.get(&network.ssid) {
            Some(existing) if existing.signal >= network.signal => {}
            _ => {
                best.insert(network.ssid.clone(), network);
            }
        }
    }

    let mut merged: Vec<WifiNetwork> = best.into_values().collect();
    merged.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.ssid.cmp(&b.ssid)));
    merged
}

/// Current association state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(ssid: &str, signal: u8) -> WifiNetwork {
        WifiNetwork {
            ssid: ssid.to_string(),
            signal,
            security: "WPA2".to_string(),
        }
    }

    #[test]
    fn test_dedup_keeps_strongest() {
        let merged = dedup_networks(vec![net("Home", 40), net("Lab", 60), net("Home", 85)]);
        assert_eq!(merged.len(), 2);
        let home: Vec<_> = merged.iter().filter(|n| n.ssid == "Home").collect();
        assert_eq!(home.len(), 1);
        assert_eq!(home[0].signal, 85);
        assert_eq!(merged[0].ssid, "Home");
    }

    #[test]
    fn test_dedup_drops_hidden() {
        let merged = dedup_networks(vec![net("", 99), net("  ", 70), net("Lab", 10)]);
        assert_eq!(merged, vec![net("Lab", 10)]);
    }

    #[test]
    fn test_open_detection() {
        let mut n = net("Cafe", 50);
        assert!(!n.is_open());
        n.security = "--".to_string();
        assert!(n.is_open());
        n.security.clear();
        assert!(n.is_open());
    }
}

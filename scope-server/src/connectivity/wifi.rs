//! WiFi scanning and association.

use shared_wasm::{dedup_networks, WifiNetwork, WifiStatus};
use std::process::Command;
use std::sync::{Arc, Mutex};

use super::ConnectivityError;

/// Platform network manager.
///
/// Calls block (they shell out or talk to hardware); [`WifiManager`] runs
/// them on the blocking pool.
pub trait WifiBackend: Send + Sync {
    /// Raw scan results; duplicates and hidden networks are allowed.
    fn scan(&self) -> Result<Vec<WifiNetwork>, ConnectivityError>;

    fn connect(&self, ssid: &str, password: Option<&str>) -> Result<(), ConnectivityError>;

    fn status(&self) -> Result<WifiStatus, ConnectivityError>;
}

/// Split one line of `nmcli -t` output, honouring `\:` and `\\` escapes.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.extend(chars.next()),
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY device wifi list`.
pub fn parse_wifi_list(output: &str) -> Vec<WifiNetwork> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            let [ssid, signal, security] = fields.as_slice() else {
                return None;
            };
            Some(WifiNetwork {
                ssid: ssid.clone(),
                signal: signal.trim().parse().ok()?,
                security: security.clone(),
            })
        })
        .collect()
}

/// Parse `nmcli -t -f ACTIVE,SSID,SIGNAL device wifi`.
pub fn parse_wifi_status(output: &str) -> WifiStatus {
    output
        .lines()
        .map(split_terse)
        .find(|fields| fields.first().is_some_and(|active| active == "yes"))
        .map(|fields| WifiStatus {
            connected: true,
            ssid: fields.get(1).cloned(),
            signal: fields.get(2).and_then(|s| s.trim().parse().ok()),
        })
        .unwrap_or_default()
}

/// NetworkManager via the `nmcli` command line tool.
pub struct NmcliBackend {
    program: String,
}

impl NmcliBackend {
    pub fn new() -> Self {
        Self {
            program: "nmcli".to_string(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, ConnectivityError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| ConnectivityError::Backend(format!("failed to run {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConnectivityError::Backend(format!(
                "{} {} failed: {}",
                self.program,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for NmcliBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiBackend for NmcliBackend {
    fn scan(&self) -> Result<Vec<WifiNetwork>, ConnectivityError> {
        let output = self.run(&[
            "-t",
            "-f",
            "SSID,SIGNAL,SECURITY",
            "device",
            "wifi",
            "list",
            "--rescan",
            "yes",
        ])?;
        Ok(parse_wifi_list(&output))
    }

    fn connect(&self, ssid: &str, password: Option<&str>) -> Result<(), ConnectivityError> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if let Some(password) = password {
            args.extend(["password", password]);
        }
        self.run(&args).map(|_| ())
    }

    fn status(&self) -> Result<WifiStatus, ConnectivityError> {
        let output = self.run(&["-t", "-f", "ACTIVE,SSID,SIGNAL", "device", "wifi"])?;
        Ok(parse_wifi_status(&output))
    }
}

/// In-memory access points for the simulator and tests.
pub struct SimulatedWifi {
    networks: Vec<WifiNetwork>,
    /// Passwords of secured networks by SSID
    passwords: Vec<(String, String)>,
    connected: Mutex<Option<String>>,
}

impl SimulatedWifi {
    pub fn new(networks: Vec<WifiNetwork>) -> Self {
        Self {
            networks,
            passwords: Vec::new(),
            connected: Mutex::new(None),
        }
    }

    pub fn with_password(mut self, ssid: &str, password: &str) -> Self {
        self.passwords.push((ssid.to_string(), password.to_string()));
        self
    }

    /// A lab with a couple of overlapping access points.
    pub fn lab() -> Self {
        let net = |ssid: &str, signal: u8, security: &str| WifiNetwork {
            ssid: ssid.to_string(),
            signal,
            security: security.to_string(),
        };
        Self::new(vec![
            net("Lab", 72, "WPA2"),
            net("Lab", 41, "WPA2"),
            net("Guest", 55, ""),
            net("", 30, "WPA2"),
        ])
        .with_password("Lab", "microscope")
    }
}

impl WifiBackend for SimulatedWifi {
    fn scan(&self) -> Result<Vec<WifiNetwork>, ConnectivityError> {
        Ok(self.networks.clone())
    }

    fn connect(&self, ssid: &str, password: Option<&str>) -> Result<(), ConnectivityError> {
        if !self.networks.iter().any(|n| n.ssid == ssid) {
            return Err(ConnectivityError::NetworkNotFound(ssid.to_string()));
        }
        if let Some((_, expected)) = self.passwords.iter().find(|(s, _)| s == ssid) {
            if password != Some(expected.as_str()) {
                return Err(ConnectivityError::Backend(format!(
                    "authentication with {ssid} failed"
                )));
            }
        }
        *self.connected.lock().unwrap() = Some(ssid.to_string());
        Ok(())
    }

    fn status(&self) -> Result<WifiStatus, ConnectivityError> {
        let connected = self.connected.lock().unwrap().clone();
        Ok(match connected {
            Some(ssid) => WifiStatus {
                connected: true,
                signal: self
                    .networks
                    .iter()
                    .filter(|n| n.ssid == ssid)
                    .map(|n| n.signal)
                    .max(),
                ssid: Some(ssid),
            },
            None => WifiStatus::default(),
        })
    }
}

/// Async front end over a [`WifiBackend`].
#[derive(Clone)]
pub struct WifiManager {
    backend: Arc<dyn WifiBackend>,
}

impl WifiManager {
    pub fn new(backend: Arc<dyn WifiBackend>) -> Self {
        Self { backend }
    }

    /// Visible networks, one entry per SSID, strongest first.
    pub async fn scan(&self) -> Result<Vec<WifiNetwork>, ConnectivityError> {
        let backend = self.backend.clone();
        let networks = tokio::task::spawn_blocking(move || backend.scan()).await??;
        let merged = dedup_networks(networks);
        tracing::info!("WiFi scan found {} networks", merged.len());
        Ok(merged)
    }

    /// Join `ssid`. Secured networks need a password; open ones ignore it.
    pub async fn connect(
        &self,
        ssid: &str,
        password: Option<String>,
    ) -> Result<WifiStatus, ConnectivityError> {
        let networks = self.scan().await?;
        let network = networks
            .iter()
            .find(|n| n.ssid == ssid)
            .ok_or_else(|| ConnectivityError::NetworkNotFound(ssid.to_string()))?;
        let password = password.filter(|p| !p.is_empty());
        let password = if network.is_open() {
            None
        } else {
            Some(password.ok_or_else(|| ConnectivityError::PasswordRequired(ssid.to_string()))?)
        };

        let backend = self.backend.clone();
        let target = ssid.to_string();
        tokio::task::spawn_blocking(move || {
            backend.connect(&target, password.as_deref())?;
            backend.status()
        })
        .await?
        .inspect(|_| tracing::info!("Connected to WiFi network {ssid}"))
    }

    pub async fn status(&self) -> Result<WifiStatus, ConnectivityError> {
        let backend = self.backend.clone();
        Ok(tokio::task::spawn_blocking(move || backend.status()).await??)
    }
}

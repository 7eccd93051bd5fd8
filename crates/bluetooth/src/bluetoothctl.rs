use crate::capability::BluetoothCapability;
use crate::classify::{is_candidate, sort_devices};
use crate::elm327;
use crate::error::{BluetoothError, BluetoothResult};
use crate::types::{BluetoothDevice, PairingStatus};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::runtime::Runtime;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SCAN_GRACE: Duration = Duration::from_secs(3);
const PROGRESS_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BluetoothCtlConfig {
    pub bluetoothctl_path: String,
    pub rfcomm_path: String,
    pub rfcomm_device: u8,
    pub rfcomm_channel: u8,
    pub pin_code: String,
    pub command_timeout: Duration,
    pub reply_timeout: Duration,
}

impl Default for BluetoothCtlConfig {
    fn default() -> Self {
        Self {
            bluetoothctl_path: "bluetoothctl".to_string(),
            rfcomm_path: "rfcomm".to_string(),
            rfcomm_device: 0,
            rfcomm_channel: 1,
            pin_code: "1234".to_string(),
            command_timeout: Duration::from_secs(20),
            reply_timeout: Duration::from_secs(5),
        }
    }
}

struct Patterns {
    ansi: Regex,
    new_device: Regex,
    rssi: Regex,
    renamed: Regex,
    listed: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            ansi: Regex::new(r"\x1b\[[0-9;]*[A-Za-z]|\x01|\x02")?,
            new_device: Regex::new(r"\[NEW\] Device ([0-9A-Fa-f:]{17}) ?(.*)$")?,
            rssi: Regex::new(
                r"\[CHG\] Device ([0-9A-Fa-f:]{17}) RSSI: (?:0x[0-9a-fA-F]+ \()?(-?\d+)",
            )?,
            renamed: Regex::new(r"\[CHG\] Device ([0-9A-Fa-f:]{17}) (?:Name|Alias): (.+)$")?,
            listed: Regex::new(r"^Device ([0-9A-Fa-f:]{17}) ?(.*)$")?,
        })
    }

    fn strip(&self, line: &str) -> String {
        self.ansi.replace_all(line, "").trim().to_string()
    }
}

#[derive(Debug, PartialEq)]
enum PairEvent {
    PinRequested,
    ConfirmRequested,
    Paired,
    Failed(String),
    Other,
}

fn classify_pair_line(line: &str) -> PairEvent {
    if line.contains("Enter PIN code") || line.contains("Enter passkey") {
        PairEvent::PinRequested
    } else if line.contains("Confirm passkey") || line.contains("Request confirmation") {
        PairEvent::ConfirmRequested
    } else if line.contains("Pairing successful") || line.contains("AlreadyExists") {
        PairEvent::Paired
    } else if line.contains("Failed to pair") || line.contains("org.bluez.Error") {
        PairEvent::Failed(line.to_string())
    } else {
        PairEvent::Other
    }
}

/// Devices accumulated while a scan runs.
struct ScanState {
    devices: Vec<BluetoothDevice>,
    reported: HashSet<String>,
    show_all_devices: bool,
}

impl ScanState {
    fn new(show_all_devices: bool) -> Self {
        Self {
            devices: Vec::new(),
            reported: HashSet::new(),
            show_all_devices,
        }
    }

    fn track(&mut self, device: BluetoothDevice, device_found: &dyn Fn(&BluetoothDevice)) {
        let mac = device.mac_address.clone();
        match self.devices.iter_mut().find(|d| d.mac_address == mac) {
            Some(existing) => {
                if !device.name.is_empty() && existing.name != device.name {
                    let signal = existing.signal_strength;
                    *existing = device;
                    existing.signal_strength = existing.signal_strength.or(signal);
                }
                existing.last_seen = chrono::Utc::now();
            }
            None => self.devices.push(device),
        }

        if let Some(current) = self.devices.iter().find(|d| d.mac_address == mac) {
            if is_candidate(current, self.show_all_devices) && self.reported.insert(mac) {
                device_found(current);
            }
        }
    }

    fn apply_line(
        &mut self,
        patterns: &Patterns,
        line: &str,
        device_found: &dyn Fn(&BluetoothDevice),
    ) {
        let line = patterns.strip(line);
        if let Some(caps) = patterns.new_device.captures(&line) {
            let name = caps[2].trim();
            // Unnamed devices are announced with their address as name.
            let name = if name.replace('-', ":").eq_ignore_ascii_case(&caps[1]) {
                ""
            } else {
                name
            };
            self.track(BluetoothDevice::new(&caps[1], name), device_found);
        } else if let Some(caps) = patterns.rssi.captures(&line) {
            let mac = caps[1].to_ascii_uppercase();
            if let (Some(device), Ok(rssi)) = (
                self.devices.iter_mut().find(|d| d.mac_address == mac),
                caps[2].parse::<i16>(),
            ) {
                device.signal_strength = Some(rssi);
                device.last_seen = chrono::Utc::now();
            }
        } else if let Some(caps) = patterns.renamed.captures(&line) {
            let mut device = BluetoothDevice::new(&caps[1], caps[2].trim());
            if let Some(existing) = self.devices.iter().find(|d| **d == device) {
                device.signal_strength = existing.signal_strength;
            }
            self.track(device, device_found);
        }
    }

    fn merge_listing(
        &mut self,
        listing: &[BluetoothDevice],
        device_found: &dyn Fn(&BluetoothDevice),
    ) {
        for device in listing {
            if !self.devices.contains(device) {
                self.track(device.clone(), device_found);
            }
        }
    }

    fn mark_paired(&mut self, paired: &[BluetoothDevice]) {
        for device in self.devices.iter_mut() {
            if paired.contains(device) {
                device.is_paired = true;
            }
        }
    }

    fn finish(mut self) -> Vec<BluetoothDevice> {
        let show_all_devices = self.show_all_devices;
        self.devices.retain(|d| is_candidate(d, show_all_devices));
        sort_devices(&mut self.devices);
        self.devices
    }
}

fn parse_listing(patterns: &Patterns, output: &str) -> Vec<BluetoothDevice> {
    output
        .lines()
        .filter_map(|line| {
            let caps = patterns.listed.captures(line.trim())?;
            Some(BluetoothDevice::new(&caps[1], caps[2].trim()))
        })
        .collect()
}

/// BlueZ access through the `bluetoothctl` and `rfcomm` command line tools.
///
/// Commands run on a private Tokio runtime so the blocking trait methods
/// can be called from plain worker threads.
pub struct BluetoothCtl {
    config: BluetoothCtlConfig,
    runtime: Runtime,
    patterns: Patterns,
    discovery_cancel: Mutex<CancellationToken>,
    pairing_cancel: Mutex<CancellationToken>,
}

impl BluetoothCtl {
    /// Verifies the tools and that a powered controller exists. Blocks for
    /// up to a few command timeouts.
    pub fn new(config: BluetoothCtlConfig) -> BluetoothResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bluez-io")
            .enable_all()
            .build()?;
        let patterns =
            Patterns::compile().map_err(|e| BluetoothError::Protocol(e.to_string()))?;

        let ctl = Self {
            config,
            runtime,
            patterns,
            discovery_cancel: Mutex::new(CancellationToken::new()),
            pairing_cancel: Mutex::new(CancellationToken::new()),
        };
        ctl.runtime.block_on(ctl.check_controller())?;
        info!("Bluetooth controller ready");
        Ok(ctl)
    }

    async fn run_program(&self, program: &str, args: &[&str]) -> BluetoothResult<String> {
        let command = format!("{} {}", program, args.join(" "));
        let output = timeout(
            self.config.command_timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| BluetoothError::Timeout(command.clone()))?
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => BluetoothError::NotAvailable(format!("{program} not installed")),
            _ => BluetoothError::Io(e),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cleaned: Vec<String> = stdout.lines().map(|l| self.patterns.strip(l)).collect();
        if !output.status.success() {
            return Err(BluetoothError::CommandFailed(format!(
                "{command} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(cleaned.join("\n"))
    }

    async fn bluetoothctl(&self, args: &[&str]) -> BluetoothResult<String> {
        self.run_program(&self.config.bluetoothctl_path, args).await
    }

    async fn check_controller(&self) -> BluetoothResult<()> {
        let version = self
            .bluetoothctl(&["--version"])
            .await
            .map_err(|e| BluetoothError::NotAvailable(format!("bluetoothctl unusable: {e}")))?;
        debug!("Using {}", version.trim());

        let show = self
            .bluetoothctl(&["show"])
            .await
            .map_err(|e| BluetoothError::NotAvailable(format!("no controller: {e}")))?;
        if !show.contains("Controller") {
            return Err(BluetoothError::NotAvailable(
                "no Bluetooth controller found".to_string(),
            ));
        }
        if show.contains("Powered: no") {
            info!("Powering on Bluetooth controller");
            self.bluetoothctl(&["power", "on"]).await?;
        }
        Ok(())
    }

    fn fresh_token(slot: &Mutex<CancellationToken>) -> CancellationToken {
        let token = CancellationToken::new();
        *slot.lock() = token.clone();
        token
    }

    async fn scan(
        &self,
        duration: Duration,
        progress: &dyn Fn(f32),
        device_found: &dyn Fn(&BluetoothDevice),
        show_all_devices: bool,
        cancel: CancellationToken,
    ) -> BluetoothResult<Vec<BluetoothDevice>> {
        let seconds = duration.as_secs().max(1);
        info!("Starting Bluetooth scan for {}s", seconds);

        let seconds_arg = seconds.to_string();
        let mut child = Command::new(&self.config.bluetoothctl_path)
            .args(["--timeout", seconds_arg.as_str(), "scan", "on"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    BluetoothError::NotAvailable("bluetoothctl not installed".to_string())
                }
                _ => BluetoothError::Io(e),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BluetoothError::CommandFailed("could not capture scan output".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut state = ScanState::new(show_all_devices);
        let started = Instant::now();
        let total = Duration::from_secs(seconds);
        let mut ticker = tokio::time::interval(PROGRESS_TICK);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = self.bluetoothctl(&["scan", "off"]).await;
                    info!("Bluetooth scan cancelled");
                    return Err(BluetoothError::Cancelled);
                }
                _ = ticker.tick() => {
                    let elapsed = started.elapsed();
                    progress((elapsed.as_secs_f32() / total.as_secs_f32()).min(1.0));
                    if elapsed > total + SCAN_GRACE {
                        warn!("bluetoothctl scan overran its timeout, stopping it");
                        let _ = child.start_kill();
                        break;
                    }
                }
                line = lines.next_line() => match line? {
                    Some(line) => state.apply_line(&self.patterns, &line, device_found),
                    None => break,
                },
            }
        }
        let _ = child.wait().await;

        match self.bluetoothctl(&["devices"]).await {
            Ok(listing) => {
                state.merge_listing(&parse_listing(&self.patterns, &listing), device_found)
            }
            Err(e) => warn!("Could not list known devices: {}", e),
        }
        // Older BlueZ releases do not support the filter argument.
        if let Ok(listing) = self.bluetoothctl(&["devices", "Paired"]).await {
            state.mark_paired(&parse_listing(&self.patterns, &listing));
        }

        progress(1.0);
        let devices = state.finish();
        info!("Scan finished with {} candidate devices", devices.len());
        Ok(devices)
    }

    async fn send(stdin: &mut ChildStdin, line: &str) -> BluetoothResult<()> {
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_clean_line(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> BluetoothResult<String> {
        match lines.next_line().await? {
            Some(line) => {
                let line = self.patterns.strip(&line);
                debug!("bluetoothctl: {}", line);
                Ok(line)
            }
            None => Err(BluetoothError::CommandFailed(
                "bluetoothctl exited unexpectedly".to_string(),
            )),
        }
    }

    /// Answers agent prompts until bluetoothctl reports the pairing outcome.
    async fn await_pairing(
        &self,
        stdin: &mut ChildStdin,
        lines: &mut Lines<BufReader<ChildStdout>>,
        status: &dyn Fn(PairingStatus, &str),
        cancel: &CancellationToken,
    ) -> BluetoothResult<bool> {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return Err(BluetoothError::Cancelled),
                line = self.next_clean_line(lines) => line?,
            };
            match classify_pair_line(&line) {
                PairEvent::PinRequested => {
                    status(PairingStatus::Connecting, "Sending PIN");
                    Self::send(stdin, &self.config.pin_code).await?;
                }
                PairEvent::ConfirmRequested => Self::send(stdin, "yes").await?,
                PairEvent::Paired => return Ok(true),
                PairEvent::Failed(reason) => {
                    warn!("Pairing failed: {}", reason);
                    return Ok(false);
                }
                PairEvent::Other => {}
            }
        }
    }

    async fn await_trust(&self, lines: &mut Lines<BufReader<ChildStdout>>) -> BluetoothResult<bool> {
        loop {
            let line = self.next_clean_line(lines).await?;
            if line.contains("trust succeeded") {
                return Ok(true);
            }
            if line.contains("Failed") || line.contains("not available") {
                return Ok(false);
            }
        }
    }

    async fn pair(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(PairingStatus, &str),
        cancel: CancellationToken,
    ) -> BluetoothResult<bool> {
        let mac = device.mac_address.as_str();
        status(PairingStatus::Connecting, "Starting pairing agent");

        let mut child = Command::new(&self.config.bluetoothctl_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            BluetoothError::CommandFailed("could not open bluetoothctl input".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BluetoothError::CommandFailed("could not capture bluetoothctl output".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        Self::send(&mut stdin, "agent KeyboardOnly").await?;
        Self::send(&mut stdin, "default-agent").await?;
        Self::send(&mut stdin, &format!("pair {mac}")).await?;
        status(
            PairingStatus::Connecting,
            &format!("Pairing with {}", device.display_name()),
        );

        let paired = timeout(
            self.config.command_timeout,
            self.await_pairing(&mut stdin, &mut lines, status, &cancel),
        )
        .await
        .map_err(|_| BluetoothError::Timeout(format!("pairing with {mac}")))??;

        if !paired {
            let _ = Self::send(&mut stdin, "quit").await;
            return Ok(false);
        }

        status(PairingStatus::Testing, "Trusting device");
        Self::send(&mut stdin, &format!("trust {mac}")).await?;
        let trusted = timeout(self.config.command_timeout, self.await_trust(&mut lines))
            .await
            .unwrap_or(Ok(false))?;
        if !trusted {
            warn!("Could not mark {} as trusted, reconnects may prompt again", mac);
        }

        let _ = Self::send(&mut stdin, "quit").await;
        if timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            let _ = child.start_kill();
        }

        let info = self.bluetoothctl(&["info", mac]).await?;
        Ok(info.contains("Paired: yes"))
    }

    async fn connection_test(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(&str),
    ) -> BluetoothResult<bool> {
        status("Binding serial port");
        let path = self.bind_rfcomm(&device.mac_address).await?;
        status(&format!("Opening {path}"));
        let port = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        elm327::probe(port, self.config.reply_timeout, status).await
    }

    async fn bind_rfcomm(&self, mac: &str) -> BluetoothResult<String> {
        let device = self.config.rfcomm_device.to_string();
        let channel = self.config.rfcomm_channel.to_string();
        let rfcomm = self.config.rfcomm_path.as_str();

        // A stale binding from a previous run makes bind fail.
        let _ = self.run_program(rfcomm, &["release", &device]).await;
        self.run_program(rfcomm, &["bind", &device, mac, &channel])
            .await?;
        Ok(format!("/dev/rfcomm{device}"))
    }
}

impl BluetoothCapability for BluetoothCtl {
    fn discover_devices(
        &self,
        timeout: Duration,
        progress: &dyn Fn(f32),
        device_found: &dyn Fn(&BluetoothDevice),
        show_all_devices: bool,
    ) -> BluetoothResult<Vec<BluetoothDevice>> {
        let cancel = Self::fresh_token(&self.discovery_cancel);
        self.runtime
            .block_on(self.scan(timeout, progress, device_found, show_all_devices, cancel))
    }

    fn pair_device(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(PairingStatus, &str),
    ) -> BluetoothResult<bool> {
        let cancel = Self::fresh_token(&self.pairing_cancel);
        let result = self.runtime.block_on(self.pair(device, status, cancel));
        match &result {
            Ok(true) => status(PairingStatus::Success, "Paired"),
            Ok(false) => status(PairingStatus::Failed, "Pairing was rejected"),
            Err(e) => status(PairingStatus::Failed, &e.to_string()),
        }
        result
    }

    fn test_obd_connection(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(&str),
    ) -> BluetoothResult<bool> {
        self.runtime.block_on(self.connection_test(device, status))
    }

    fn cancel_discovery(&self) {
        self.discovery_cancel.lock().cancel();
    }

    fn cancel_pairing(&self) {
        self.pairing_cancel.lock().cancel();
    }
}

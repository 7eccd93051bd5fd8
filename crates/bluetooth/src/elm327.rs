//! Minimal ELM327 conversation over any byte stream.
//!
//! Commands are ASCII terminated by `\r`; the adapter answers with one or
//! more lines followed by the `>` prompt. Responses are matched as strings.

use crate::error::{BluetoothError, BluetoothResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const PROMPT: u8 = b'>';
const SETUP_COMMANDS: &[&str] = &["ATE0", "ATL0", "ATSP0"];

pub struct Elm327<S> {
    stream: S,
    reply_timeout: Duration,
}

impl<S> Elm327<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, reply_timeout: Duration) -> Self {
        Self {
            stream,
            reply_timeout,
        }
    }

    pub async fn command(&mut self, cmd: &str) -> BluetoothResult<String> {
        debug!("ELM327 >> {}", cmd);
        self.stream.write_all(format!("{cmd}\r").as_bytes()).await?;
        self.stream.flush().await?;

        let raw = timeout(self.reply_timeout, read_until_prompt(&mut self.stream))
            .await
            .map_err(|_| BluetoothError::Timeout(format!("no reply to {cmd}")))??;

        let response = clean_response(&raw, cmd);
        debug!("ELM327 << {}", response);
        Ok(response)
    }

    /// Resets the adapter and applies the settings the gauge relies on.
    /// Returns the identification banner.
    pub async fn initialize(&mut self) -> BluetoothResult<String> {
        let banner = self.command("ATZ").await?;
        if !is_elm_banner(&banner) {
            return Err(BluetoothError::Protocol(format!(
                "unexpected reply to ATZ: {banner}"
            )));
        }

        for cmd in SETUP_COMMANDS {
            let reply = self.command(cmd).await?;
            if !reply.contains("OK") {
                return Err(BluetoothError::Protocol(format!("{cmd} answered {reply}")));
            }
        }

        Ok(banner)
    }

    /// Asks for supported PIDs; a `41 00` answer means an ECU is talking.
    pub async fn ecu_responds(&mut self) -> BluetoothResult<bool> {
        let reply = self.command("0100").await?;
        Ok(compact_hex(&reply).contains("4100"))
    }

    pub async fn read_rpm(&mut self) -> BluetoothResult<Option<u32>> {
        let reply = self.command("010C").await?;
        Ok(parse_rpm(&reply))
    }
}

/// Runs the connection test conversation. `Ok(false)` means something
/// answered, but not like an ELM327.
pub async fn probe<S>(
    stream: S,
    reply_timeout: Duration,
    status: &dyn Fn(&str),
) -> BluetoothResult<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut elm = Elm327::new(stream, reply_timeout);

    status("Resetting adapter");
    let banner = match elm.initialize().await {
        Ok(banner) => banner,
        Err(BluetoothError::Protocol(msg)) => {
            status(&msg);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    status(&format!("Found {banner}"));

    if elm.ecu_responds().await? {
        status("Vehicle ECU responding");
    } else {
        status("Adapter OK, vehicle not responding (ignition off?)");
    }
    Ok(true)
}

pub fn is_elm_banner(response: &str) -> bool {
    response.to_ascii_uppercase().contains("ELM327")
}

/// Decodes a `41 0C A B` reply into engine RPM, `(A * 256 + B) / 4`.
pub fn parse_rpm(response: &str) -> Option<u32> {
    let hex = compact_hex(response);
    let start = hex.find("410C")? + 4;
    let data = hex.get(start..start + 4)?;
    let a = u32::from_str_radix(data.get(..2)?, 16).ok()?;
    let b = u32::from_str_radix(data.get(2..)?, 16).ok()?;
    Some((a * 256 + b) / 4)
}

fn compact_hex(response: &str) -> String {
    response
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

async fn read_until_prompt<S>(stream: &mut S) -> BluetoothResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(BluetoothError::Protocol(
                "connection closed by adapter".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.iter().position(|b| *b == PROMPT) {
            buf.truncate(pos);
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

fn clean_response(raw: &str, cmd: &str) -> String {
    raw.split(|c| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.eq_ignore_ascii_case(cmd))
        .filter(|line| !line.starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::io::{duplex, DuplexStream};

    async fn fake_adapter(mut io: DuplexStream, replies: Vec<(&'static str, &'static str)>) {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&chunk[..n]);
            while let Some(pos) = pending.iter().position(|b| *b == b'\r') {
                let cmd = String::from_utf8_lossy(&pending[..pos]).into_owned();
                pending.drain(..=pos);
                let reply = replies
                    .iter()
                    .find(|(c, _)| *c == cmd)
                    .map(|(_, r)| *r)
                    .unwrap_or("?");
                let frame = format!("{cmd}\r{reply}\r\r>");
                if io.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    fn healthy_replies() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ATZ", "\rELM327 v1.5"),
            ("ATE0", "OK"),
            ("ATL0", "OK"),
            ("ATSP0", "OK"),
            ("0100", "SEARCHING...\r41 00 BE 3E B8 11"),
            ("010C", "41 0C 1A F8"),
        ]
    }

    #[test]
    fn parses_rpm_reply() {
        assert_eq!(parse_rpm("41 0C 1A F8"), Some(1726));
        assert_eq!(parse_rpm("410C0000"), Some(0));
        assert_eq!(parse_rpm("NO DATA"), None);
        assert_eq!(parse_rpm("41 0C 1A"), None);
        assert_eq!(parse_rpm("41 0C A\u{FFFD}"), None);
        assert_eq!(parse_rpm("41 0C \u{FFFD}1A"), None);
    }

    #[test]
    fn cleans_echo_and_blank_lines() {
        assert_eq!(clean_response("ATZ\r\rELM327 v1.5\r\r", "ATZ"), "ELM327 v1.5");
        assert_eq!(
            clean_response("0100\rSEARCHING...\r41 00 BE\r", "0100"),
            "41 00 BE"
        );
    }

    #[tokio::test]
    async fn initializes_and_reads_rpm() {
        let (client, adapter) = duplex(256);
        tokio::spawn(fake_adapter(adapter, healthy_replies()));

        let mut elm = Elm327::new(client, Duration::from_secs(1));
        let banner = elm.initialize().await.expect("initialize");
        assert_eq!(banner, "ELM327 v1.5");
        assert!(elm.ecu_responds().await.expect("0100"));
        assert_eq!(elm.read_rpm().await.expect("010C"), Some(1726));
    }

    #[tokio::test]
    async fn probe_reports_progress_and_succeeds() {
        let (client, adapter) = duplex(256);
        tokio::spawn(fake_adapter(adapter, healthy_replies()));

        let messages = RefCell::new(Vec::new());
        let ok = probe(client, Duration::from_secs(1), &|m: &str| {
            messages.borrow_mut().push(m.to_string())
        })
        .await
        .expect("probe");

        assert!(ok);
        let messages = messages.into_inner();
        assert!(messages.iter().any(|m| m.contains("ELM327")));
        assert_eq!(messages.last().map(String::as_str), Some("Vehicle ECU responding"));
    }

    #[tokio::test]
    async fn probe_rejects_non_elm_device() {
        let (client, adapter) = duplex(256);
        tokio::spawn(fake_adapter(adapter, vec![("ATZ", "HELLO FROM SPEAKER")]));

        let ok = probe(client, Duration::from_secs(1), &|_: &str| {})
            .await
            .expect("probe");
        assert!(!ok);
    }

    #[tokio::test]
    async fn silent_adapter_times_out() {
        let (client, _adapter) = duplex(256);
        let mut elm = Elm327::new(client, Duration::from_millis(50));
        let err = elm.command("ATZ").await.expect_err("should time out");
        assert!(matches!(err, BluetoothError::Timeout(_)));
    }
}

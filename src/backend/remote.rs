use super::{describe_target, FlashOptions, FlashProgress, FlashReport, ProgrammerBackend, ProgressCallback};
use crate::config::RemoteBridgeConfig;
use crate::core::{BackendKind, FlashStage, TargetInfo};
use crate::error::{ForgeError, ForgeResult};
use crate::firmware::FirmwareImage;
use crate::targets::{DeviceId, McuFamily};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;
use tokio::time::Instant;

const UPLOAD_CHUNK: usize = 4096;

static PERCENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,3})\s*%").expect("percent pattern"));
static BYTE_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*bytes?").expect("byte count pattern"));
static HEX_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0[xX][0-9a-fA-F]{1,8}").expect("hex value pattern"));

/// Family the bridge firmware assigns from the identifier's part-number
/// field. It disagrees with the device table for some identifiers, so it is
/// only a last-resort hint.
pub fn bridge_family(id: DeviceId) -> McuFamily {
    match (id.0 >> 12) & 0xFFF {
        0x410 | 0x414 => McuFamily::F1,
        0x411 => McuFamily::F2,
        0x413 | 0x421 | 0x431 => McuFamily::F4,
        0x418 => McuFamily::L1,
        0x420 | 0x440 => McuFamily::F0,
        0x432 => McuFamily::F3,
        0x444 | 0x447 => McuFamily::L0,
        0x450 | 0x457 | 0x458 | 0x480 | 0x482 => McuFamily::H7,
        0x451 | 0x452 => McuFamily::F7,
        0x464 | 0x470 | 0x471 => McuFamily::L4,
        0x490 => McuFamily::WB,
        0x495 => McuFamily::WL,
        _ => McuFamily::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Ok(String),
    Error(String),
    Info(String),
    Other(String),
}

impl Reply {
    fn parse(line: &str) -> Reply {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("OK:") {
            Reply::Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("ERROR:") {
            Reply::Error(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("INFO:") {
            Reply::Info(rest.trim().to_string())
        } else {
            Reply::Other(line.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredBridge {
    pub host: String,
    pub port: u16,
    pub banner: String,
}

/// Hosts `.2` through `.254` of a /24 given as its first three octets,
/// e.g. `192.168.4` for the bridge's own access point.
pub fn subnet_hosts(prefix: &str) -> Vec<String> {
    let prefix = prefix.trim().trim_end_matches('.');
    (2..=254).map(|i| format!("{}.{}", prefix, i)).collect()
}

async fn read_banner(host: &str, port: u16, timeout: Duration) -> Option<String> {
    let attempt = async {
        let stream = TcpStream::connect((host, port)).await.ok()?;
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.ok()?;
        Some(line.trim().to_string())
    };
    tokio::time::timeout(timeout, attempt).await.ok().flatten()
}

/// Greet every host on `port` at once and keep those whose welcome line
/// carries `banner_prefix`. Nothing is sent to any host. Results keep the
/// order of `hosts`.
pub async fn discover(hosts: &[String], port: u16, banner_prefix: &str, timeout: Duration) -> Vec<DiscoveredBridge> {
    let mut probes = JoinSet::new();
    for (index, host) in hosts.iter().cloned().enumerate() {
        probes.spawn(async move {
            let banner = read_banner(&host, port, timeout).await;
            (index, host, banner)
        });
    }

    let mut found = Vec::new();
    while let Some(joined) = probes.join_next().await {
        let Ok((index, host, Some(banner))) = joined else {
            continue;
        };
        if banner.contains(banner_prefix) {
            tracing::info!("Discovered bridge {}:{}: {}", host, port, banner);
            found.push((index, DiscoveredBridge { host, port, banner }));
        } else {
            tracing::debug!("{}:{} answered with a foreign banner: {}", host, port, banner);
        }
    }
    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, bridge)| bridge).collect()
}

/// One open session with a bridge. Requests and replies strictly alternate.
struct BridgeConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    transcript: Vec<String>,
}

impl BridgeConnection {
    async fn open(config: &RemoteBridgeConfig) -> ForgeResult<Self> {
        let endpoint = config.endpoint();
        tracing::debug!("Connecting to bridge {}", endpoint);
        let stream = match tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ForgeError::device(
                    format!("cannot reach bridge {}: {}", endpoint, e),
                    format!("connect {}: {} ({:?})", endpoint, e, e.kind()),
                ))
            }
            Err(_) => {
                return Err(ForgeError::Timeout {
                    operation: format!("connect to bridge {}", endpoint),
                    timeout: config.connect_timeout(),
                    output: String::new(),
                })
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read),
            writer,
            transcript: Vec::new(),
        };

        let banner = conn.read_line(config.connect_timeout()).await?;
        if !banner.contains(&config.banner_prefix) {
            return Err(ForgeError::device(
                format!("unexpected welcome from {}, expected '{}'", endpoint, config.banner_prefix),
                banner,
            ));
        }
        tracing::info!("Connected to bridge {}: {}", endpoint, banner);
        Ok(conn)
    }

    fn output(&self) -> String {
        self.transcript.join("\n")
    }

    async fn read_line(&mut self, timeout: Duration) -> ForgeResult<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) => Err(ForgeError::device("bridge closed the connection", self.output())),
            Ok(Ok(_)) => {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                self.transcript.push(line.clone());
                Ok(line)
            }
            Ok(Err(e)) => Err(ForgeError::device(format!("bridge read failed: {}", e), self.output())),
            Err(_) => Err(ForgeError::Timeout {
                operation: "bridge reply".to_string(),
                timeout,
                output: self.output(),
            }),
        }
    }

    async fn send(&mut self, command: &str) -> ForgeResult<()> {
        tracing::debug!("bridge <- {}", command);
        self.transcript.push(format!("> {}", command));
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| ForgeError::device(format!("bridge write failed: {}", e), self.output()))
    }

    /// Send a command and return the payload of its terminal `OK:` reply.
    /// `INFO:` lines in between are skipped.
    async fn request(&mut self, command: &str, timeout: Duration) -> ForgeResult<String> {
        self.send(command).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = self.read_line(remaining).await?;
            match Reply::parse(&line) {
                Reply::Ok(payload) => return Ok(payload),
                Reply::Error(message) => {
                    return Err(ForgeError::device(
                        format!("bridge rejected '{}': {}", command, message),
                        self.output(),
                    ))
                }
                Reply::Info(_) | Reply::Other(_) => continue,
            }
        }
    }

    async fn upload(&mut self, data: &[u8], config: &RemoteBridgeConfig, progress: &ProgressCallback<'_>) -> ForgeResult<usize> {
        self.request(&format!("upload {}", data.len()), config.command_timeout())
            .await?;

        let mut sent = 0usize;
        for chunk in data.chunks(UPLOAD_CHUNK) {
            let write = tokio::time::timeout(config.command_timeout(), self.writer.write_all(chunk)).await;
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(ForgeError::device(format!("upload interrupted: {}", e), self.output())),
                Err(_) => {
                    return Err(ForgeError::Timeout {
                        operation: "firmware upload".to_string(),
                        timeout: config.command_timeout(),
                        output: self.output(),
                    })
                }
            }
            sent += chunk.len();
            let percent = (sent * 50 / data.len().max(1)) as u8;
            progress(FlashProgress::new(
                FlashStage::Programming,
                percent,
                format!("uploaded {}/{} bytes", sent, data.len()),
            ));
        }
        self.transcript.push(format!("> <{} bytes>", sent));

        let ack = self.read_line(config.command_timeout()).await?;
        match Reply::parse(&ack) {
            Reply::Ok(payload) => {
                let acknowledged = BYTE_COUNT
                    .captures(&payload)
                    .and_then(|caps| caps[1].parse::<usize>().ok())
                    .unwrap_or(sent);
                if acknowledged != sent {
                    return Err(ForgeError::device(
                        format!("bridge acknowledged {} bytes, {} were sent", acknowledged, sent),
                        self.output(),
                    ));
                }
                Ok(acknowledged)
            }
            _ => Err(ForgeError::device("bridge did not accept the upload", self.output())),
        }
    }

    /// `flash`, then progress lines until the terminal reply.
    async fn program(&mut self, timeout: Duration, progress: &ProgressCallback<'_>) -> ForgeResult<String> {
        self.send("flash").await?;
        let deadline = Instant::now() + timeout;
        let mut percent = 50u8;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ForgeError::Timeout {
                    operation: "flash".to_string(),
                    timeout,
                    output: self.output(),
                });
            }
            let line = self.read_line(remaining).await?;
            match Reply::parse(&line) {
                Reply::Ok(payload) => return Ok(payload),
                Reply::Error(message) if message.to_ascii_lowercase().contains("verif") => {
                    return Err(ForgeError::VerificationFailed {
                        message,
                        output: self.output(),
                    })
                }
                Reply::Error(message) => return Err(ForgeError::device(message, self.output())),
                Reply::Info(message) => {
                    // Lines without a percentage keep the last one reported.
                    if let Some(p) = PERCENT
                        .captures(&message)
                        .and_then(|caps| caps[1].parse::<u8>().ok())
                    {
                        percent = 50 + p.min(100) / 2;
                    }
                    let stage = if message.to_ascii_lowercase().contains("verif") {
                        FlashStage::Verifying
                    } else {
                        FlashStage::Programming
                    };
                    progress(FlashProgress::new(stage, percent, message));
                }
                Reply::Other(_) => {}
            }
        }
    }

    async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn parse_hex_id(payload: &str, raw: String) -> ForgeResult<DeviceId> {
    HEX_VALUE
        .find(payload)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| ForgeError::device(format!("no identifier in bridge reply '{}'", payload), raw))
}

/// Network bridge speaking the line protocol over one persistent connection.
pub struct RemoteBridgeBackend {
    config: RemoteBridgeConfig,
    name: String,
    session: Mutex<Option<BridgeConnection>>,
    version: RwLock<Option<String>>,
}

impl RemoteBridgeBackend {
    pub fn new(config: RemoteBridgeConfig) -> Self {
        let name = format!("remote-bridge@{}", config.endpoint());
        Self {
            config,
            name,
            session: Mutex::new(None),
            version: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RemoteBridgeConfig {
        &self.config
    }

    fn claim(&self) -> ForgeResult<MutexGuard<'_, Option<BridgeConnection>>> {
        self.session
            .try_lock()
            .map_err(|_| ForgeError::Busy(self.name.clone()))
    }

    /// Take the open connection, or open one. A connection is put back only
    /// after an exchange completes cleanly, so any failure closes it.
    async fn checkout(&self, slot: &mut Option<BridgeConnection>) -> ForgeResult<BridgeConnection> {
        match slot.take() {
            Some(conn) => Ok(conn),
            None => BridgeConnection::open(&self.config).await,
        }
    }
}

#[async_trait]
impl ProgrammerBackend for RemoteBridgeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    /// Last version line the bridge answered with.
    fn version(&self) -> Option<String> {
        self.version.read().clone()
    }

    async fn connect(&self) -> ForgeResult<()> {
        let mut slot = self.claim()?;
        if slot.is_none() {
            *slot = Some(BridgeConnection::open(&self.config).await?);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let conn = self.session.lock().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
            tracing::debug!("Disconnected from bridge {}", self.config.endpoint());
        }
    }

    async fn is_available(&self) -> bool {
        let Ok(mut slot) = self.claim() else {
            return false;
        };
        let mut conn = match self.checkout(&mut slot).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!("Bridge {} unavailable: {}", self.config.endpoint(), e);
                return false;
            }
        };
        match conn.request("version", self.config.command_timeout()).await {
            Ok(version) => {
                *self.version.write() = Some(version);
                conn.transcript.clear();
                *slot = Some(conn);
                true
            }
            Err(e) => {
                tracing::debug!("Bridge {} did not answer version: {}", self.config.endpoint(), e);
                false
            }
        }
    }

    async fn detect_target(&self) -> ForgeResult<TargetInfo> {
        let mut slot = self.claim()?;
        let mut conn = self.checkout(&mut slot).await?;
        let payload = conn.request("idcode", self.config.command_timeout()).await?;
        let id = parse_hex_id(&payload, conn.output())?;
        let target = describe_target(id, Some(bridge_family(id)));
        tracing::info!("Bridge {} detected {} ({})", self.config.endpoint(), target.name, id);
        conn.transcript.clear();
        *slot = Some(conn);
        Ok(target)
    }

    async fn flash(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        progress: &ProgressCallback<'_>,
    ) -> ForgeResult<FlashReport> {
        let flat = image.to_flat(self.config.flash_base_address)?;
        if flat.base_address != self.config.flash_base_address {
            return Err(ForgeError::validation(format!(
                "image starts at 0x{:08X}; the bridge only programs at 0x{:08X}",
                flat.base_address, self.config.flash_base_address
            )));
        }
        if flat.data.is_empty() {
            return Err(ForgeError::validation("firmware image is empty"));
        }

        let mut slot = self.claim()?;
        let mut conn = self.checkout(&mut slot).await?;
        conn.transcript.clear();

        progress(FlashProgress::new(
            FlashStage::Programming,
            0,
            format!("uploading {} bytes to {}", flat.data.len(), self.config.endpoint()),
        ));
        let bytes = conn.upload(&flat.data, &self.config, progress).await?;

        let timeout = options.timeout.min(self.config.flash_timeout());
        let message = conn.program(timeout, progress).await?;

        let mut device_id = None;
        if options.reset {
            progress(FlashProgress::new(FlashStage::Resetting, 95, "resetting target"));
            let reply = conn.request("reset", self.config.command_timeout()).await?;
            device_id = HEX_VALUE
                .find(&reply)
                .and_then(|m| m.as_str().parse::<DeviceId>().ok())
                .map(|id| id.to_string());
        }
        progress(FlashProgress::new(FlashStage::Done, 100, "flash complete"));

        let stdout = conn.output();
        conn.transcript.clear();
        *slot = Some(conn);

        Ok(FlashReport {
            device_id,
            bytes,
            verified: true,
            message: if message.is_empty() {
                "Flash successful".to_string()
            } else {
                message
            },
            stdout,
            stderr: String::new(),
        })
    }

    async fn reset(&self) -> ForgeResult<()> {
        let mut slot = self.claim()?;
        let mut conn = self.checkout(&mut slot).await?;
        conn.request("reset", self.config.command_timeout()).await?;
        conn.transcript.clear();
        *slot = Some(conn);
        Ok(())
    }
}

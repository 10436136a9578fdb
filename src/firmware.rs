//! Firmware images: loading, format sniffing and conversion to the flat
//! binary the network bridge programs.

use crate::error::{ForgeError, ForgeResult};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

/// Conventional artifact location relative to the workspace root.
pub const ARTIFACT_DIR: &str = "out/artifacts";

/// Upper bound on a flattened image; larger spans mean a malformed file.
const MAX_FLAT_IMAGE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirmwareFormat {
    IntelHex,
    SRecord,
    Elf,
    Binary,
}

impl FirmwareFormat {
    /// Decide by content, never by file name.
    pub fn sniff(data: &[u8]) -> FirmwareFormat {
        let text = data
            .strip_prefix(&[0xEF, 0xBB, 0xBF])
            .unwrap_or(data)
            .trim_ascii_start();
        if data.starts_with(b"\x7fELF") {
            FirmwareFormat::Elf
        } else if text.first() == Some(&b':') && is_ascii_records(text) {
            FirmwareFormat::IntelHex
        } else if text.len() >= 2
            && text[0] == b'S'
            && text[1].is_ascii_digit()
            && is_ascii_records(text)
        {
            FirmwareFormat::SRecord
        } else {
            FirmwareFormat::Binary
        }
    }

    /// Scratch-file suffix the probe driver uses to pick its loader.
    pub fn extension(self) -> &'static str {
        match self {
            FirmwareFormat::IntelHex => "hex",
            FirmwareFormat::SRecord => "srec",
            FirmwareFormat::Elf => "elf",
            FirmwareFormat::Binary => "bin",
        }
    }

    /// Raw binaries carry no load address and must be placed explicitly.
    pub fn needs_base_address(self) -> bool {
        self == FirmwareFormat::Binary
    }
}

fn is_ascii_records(text: &[u8]) -> bool {
    text.iter()
        .take(4096)
        .all(|b| b.is_ascii_hexdigit() || matches!(b, b':' | b'S' | b'\r' | b'\n' | b' ' | b'\t'))
}

#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub path: Option<PathBuf>,
    pub format: FirmwareFormat,
    pub data: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            path: None,
            format: FirmwareFormat::sniff(&data),
            data,
        }
    }

    pub async fn load(path: &Path) -> ForgeResult<Self> {
        let data = fs::read(path)
            .await
            .map_err(|e| ForgeError::validation(format!("cannot read firmware {}: {}", path.display(), e)))?;
        if data.is_empty() {
            return Err(ForgeError::validation(format!("firmware {} is empty", path.display())));
        }
        let mut image = Self::from_bytes(data);
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat image for programmers that only accept raw bytes at an address.
    pub fn to_flat(&self, default_base: u32) -> ForgeResult<FlatImage> {
        match self.format {
            FirmwareFormat::Binary => Ok(FlatImage {
                base_address: default_base,
                data: self.data.clone(),
            }),
            FirmwareFormat::IntelHex => {
                let text = std::str::from_utf8(&self.data)
                    .map_err(|_| ForgeError::validation("Intel HEX file is not valid ASCII"))?;
                intel_hex_to_binary(text)
            }
            other => Err(ForgeError::validation(format!(
                "{:?} firmware must be converted to .hex or .bin before remote programming",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatImage {
    pub base_address: u32,
    pub data: Vec<u8>,
}

fn hex_error(line_no: usize, reason: &str) -> ForgeError {
    ForgeError::validation(format!("Intel HEX line {}: {}", line_no, reason))
}

fn decode_record(line: &str, line_no: usize) -> ForgeResult<Vec<u8>> {
    let body = line
        .strip_prefix(':')
        .ok_or_else(|| hex_error(line_no, "missing ':' start code"))?;
    if body.len() % 2 != 0 || !body.is_ascii() {
        return Err(hex_error(line_no, "odd number of hex digits"));
    }
    let bytes = (0..body.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| hex_error(line_no, "invalid hex digit"))?;
    if bytes.len() < 5 || bytes.len() != 5 + bytes[0] as usize {
        return Err(hex_error(line_no, "length does not match byte count"));
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(hex_error(line_no, "checksum mismatch"));
    }
    Ok(bytes)
}

/// Flatten Intel HEX into one contiguous image. Gaps between records are
/// filled with 0xFF, the erased-flash value.
pub fn intel_hex_to_binary(text: &str) -> ForgeResult<FlatImage> {
    let mut upper: u32 = 0;
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let record = decode_record(line, line_no)?;
        let count = record[0] as usize;
        let offset = u32::from(u16::from_be_bytes([record[1], record[2]]));
        let payload = &record[4..4 + count];
        match record[3] {
            0x00 => chunks.push((upper.wrapping_add(offset), payload.to_vec())),
            0x01 => break,
            0x02 if count == 2 => upper = u32::from(u16::from_be_bytes([payload[0], payload[1]])) << 4,
            0x04 if count == 2 => upper = u32::from(u16::from_be_bytes([payload[0], payload[1]])) << 16,
            0x03 | 0x05 => {}
            other => return Err(hex_error(line_no, &format!("unsupported record type {:02X}", other))),
        }
    }

    let base = chunks
        .iter()
        .map(|(addr, _)| *addr)
        .min()
        .ok_or_else(|| ForgeError::validation("Intel HEX file contains no data records"))?;
    let end = chunks
        .iter()
        .map(|(addr, data)| u64::from(*addr) + data.len() as u64)
        .max()
        .unwrap_or(u64::from(base));
    let span = end - u64::from(base);
    if span > u64::from(MAX_FLAT_IMAGE) {
        return Err(ForgeError::validation(format!(
            "Intel HEX spans {} bytes from 0x{:08X}, refusing to flatten",
            span, base
        )));
    }

    let mut data = vec![0xFF; span as usize];
    for (addr, bytes) in chunks {
        let start = (addr - base) as usize;
        data[start..start + bytes.len()].copy_from_slice(&bytes);
    }
    Ok(FlatImage {
        base_address: base,
        data,
    })
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

/// Explicit absolute path as given; a relative one is tried under the
/// artifact directory, then the workspace root. With nothing given the
/// newest `.hex` artifact wins, then the newest `.bin`.
pub async fn resolve_firmware_path(workspace: &Path, requested: Option<&Path>) -> ForgeResult<PathBuf> {
    let artifacts = workspace.join(ARTIFACT_DIR);
    match requested {
        Some(path) if path.is_absolute() => {
            if is_file(path).await {
                Ok(path.to_path_buf())
            } else {
                Err(ForgeError::validation(format!("firmware not found: {}", path.display())))
            }
        }
        Some(path) => {
            if !is_plain_relative(path) {
                return Err(ForgeError::validation(format!(
                    "firmware path must stay inside the workspace: {}",
                    path.display()
                )));
            }
            for candidate in [artifacts.join(path), workspace.join(path)] {
                if is_file(&candidate).await {
                    return Ok(candidate);
                }
            }
            Err(ForgeError::validation(format!(
                "firmware {} not found under {} or the workspace root",
                path.display(),
                ARTIFACT_DIR
            )))
        }
        None => {
            for ext in ["hex", "bin"] {
                if let Some(found) = newest_with_extension(&artifacts, ext).await {
                    tracing::debug!("Auto-selected firmware {:?}", found);
                    return Ok(found);
                }
            }
            Err(ForgeError::validation(format!(
                "no .hex or .bin firmware in {}; build first or pass a firmware path",
                artifacts.display()
            )))
        }
    }
}

async fn newest_with_extension(dir: &Path, ext: &str) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path)
}

//! Single-target device-mapper table rows and their kernel wire format.
//!
//! A row renders as `"<start> <size> <type> <parameters>"`. The parameter
//! payload is opaque: it may carry raw key material or arbitrary bytes, so it
//! is never re-tokenised and never leaves a [`SecureBytes`].

use crate::config::CryptCfg;
use crate::error::{CryptKeyError, TableParseError};
use crate::secure::SecureBytes;
use crate::task::TargetRow;
use log::error;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Bytes per device-mapper sector.
pub const SECTOR_SIZE: u64 = 512;

/// Longest target type name the kernel accepts.
pub const MAX_TARGET_TYPE_LEN: usize = 127;

/// Cipher used for encrypted stateful devices unless configured otherwise.
pub const DEFAULT_CRYPT_CIPHER: &str = "aes-cbc-essiv:sha256";

const CRYPT_TARGET: &str = "crypt";
const ALLOW_DISCARDS: &[u8] = b" 1 allow_discards";

/// One target row of a device-mapper table.
///
/// An empty `target_type` is the "no table" sentinel produced by
/// [`create_table_from_blob`](Self::create_table_from_blob); it never names a
/// configured target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevmapperTable {
    start: u64,
    size: u64,
    target_type: String,
    parameters: SecureBytes,
}

impl DevmapperTable {
    pub fn new(start: u64, size: u64, target_type: impl Into<String>, parameters: SecureBytes) -> Self {
        Self {
            start,
            size,
            target_type: target_type.into(),
            parameters,
        }
    }

    /// The `(0, 0, "", [])` sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the sentinel, i.e. when no target type is set.
    pub fn is_empty(&self) -> bool {
        self.target_type.is_empty()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn parameters(&self) -> &SecureBytes {
        &self.parameters
    }

    /// Render the row in kernel table syntax. Parameters are appended verbatim.
    pub fn to_blob(&self) -> SecureBytes {
        let header = format!("{} {} {} ", self.start, self.size, self.target_type);
        SecureBytes::concat(&[&SecureBytes::from(header.as_str()), &self.parameters])
    }

    /// Parse one row of kernel table syntax.
    ///
    /// The first three whitespace-separated fields are decoded; everything after
    /// the whitespace that follows the third field is kept byte-for-byte as the
    /// parameter payload, which must not be empty.
    pub fn parse(blob: &[u8]) -> Result<Self, TableParseError> {
        let row = Self::parse_row(blob)?;
        if row.parameters.is_empty() {
            return Err(TableParseError::EmptyParameters);
        }
        Ok(row.into())
    }

    /// Like [`parse`](Self::parse) but accepts rows without parameters, as
    /// the kernel reports for `error` and `zero` targets.
    pub fn parse_row(blob: &[u8]) -> Result<TargetRow, TableParseError> {
        let (start_from, start_to) = next_token(blob, 0).ok_or(TableParseError::MissingFields)?;
        let (size_from, size_to) =
            next_token(blob, start_to).ok_or(TableParseError::MissingFields)?;
        let (type_from, type_to) =
            next_token(blob, size_to).ok_or(TableParseError::MissingFields)?;

        let start = parse_u64(&blob[start_from..start_to], "start")?;
        let size = parse_u64(&blob[size_from..size_to], "size")?;

        let type_bytes = &blob[type_from..type_to];
        if type_bytes.len() > MAX_TARGET_TYPE_LEN {
            return Err(TableParseError::TypeTooLong {
                len: type_bytes.len(),
            });
        }
        let target_type = std::str::from_utf8(type_bytes)
            .ok()
            .filter(|name| name.is_ascii())
            .ok_or(TableParseError::InvalidType)?;

        let params_from = skip_space(blob, type_to);
        Ok(TargetRow {
            start,
            size,
            target_type: target_type.to_string(),
            parameters: SecureBytes::from(&blob[params_from..]),
        })
    }

    /// Sentinel-returning variant of [`parse`](Self::parse).
    pub fn create_table_from_blob(blob: &[u8]) -> Self {
        Self::parse(blob).unwrap_or_default()
    }

    /// Extract the raw key from a `crypt` target's parameters.
    pub fn crypt_key(&self) -> Result<SecureBytes, CryptKeyError> {
        if self.target_type != CRYPT_TARGET {
            return Err(CryptKeyError::NotCrypt);
        }

        let params = self.parameters.as_slice();
        let (_, cipher_to) = next_token(params, 0).ok_or(CryptKeyError::MissingCipher)?;
        let (key_from, key_to) =
            next_token(params, cipher_to).ok_or(CryptKeyError::MissingKey)?;

        SecureBytes::hex_decode(&params[key_from..key_to]).map_err(|_| CryptKeyError::InvalidHex)
    }

    /// Key extraction that yields an empty blob on any failure.
    pub fn crypt_get_key(&self) -> SecureBytes {
        match self.crypt_key() {
            Ok(key) => key,
            Err(CryptKeyError::NotCrypt) => {
                error!(
                    "cannot read dm-crypt key from `{}` target",
                    self.target_type
                );
                SecureBytes::new()
            }
            Err(err) => {
                error!("dm-crypt key extraction failed: {err}");
                SecureBytes::new()
            }
        }
    }

    /// Build the parameter string for a `crypt` target:
    /// `<cipher> <hex key> <iv_offset> <device_path> <device_offset>[ 1 allow_discards]`.
    ///
    /// The cipher prefix, the hex key and the trailing fields are rendered into
    /// separate secure buffers and joined once, so the key is never formatted
    /// alongside other text in ordinary memory.
    pub fn crypt_create_parameters(
        cipher: &str,
        key: &SecureBytes,
        iv_offset: u64,
        device_path: &Path,
        device_offset: u64,
        allow_discard: bool,
    ) -> SecureBytes {
        let mut head = SecureBytes::with_capacity(cipher.len() + 1);
        head.append(cipher.as_bytes());
        head.append(b" ");

        let key_hex = key.hex_encode();

        let mut tail = SecureBytes::new();
        tail.append(format!(" {iv_offset} ").as_bytes());
        tail.append(device_path.as_os_str().as_bytes());
        tail.append(format!(" {device_offset}").as_bytes());
        if allow_discard {
            tail.append(ALLOW_DISCARDS);
        }

        SecureBytes::concat(&[&head, &key_hex, &tail])
    }
}

impl From<TargetRow> for DevmapperTable {
    fn from(row: TargetRow) -> Self {
        Self::new(row.start, row.size, row.target_type, row.parameters)
    }
}

/// Everything needed to map a backing device through dm-crypt.
#[derive(Debug, Clone)]
pub struct CryptSpec {
    pub cipher: String,
    pub key: SecureBytes,
    pub iv_offset: u64,
    pub device_path: PathBuf,
    pub device_offset: u64,
    pub allow_discards: bool,
}

impl CryptSpec {
    /// Spec for `device_path` using the default cipher, zero offsets and discards on.
    pub fn new(key: SecureBytes, device_path: impl Into<PathBuf>) -> Self {
        Self {
            cipher: DEFAULT_CRYPT_CIPHER.to_string(),
            key,
            iv_offset: 0,
            device_path: device_path.into(),
            device_offset: 0,
            allow_discards: true,
        }
    }

    /// Spec for `device_path` with the cipher and discard policy from `[crypt]`.
    pub fn from_config(key: SecureBytes, device_path: impl Into<PathBuf>, cfg: &CryptCfg) -> Self {
        Self {
            cipher: cfg.cipher.clone(),
            allow_discards: cfg.allow_discards,
            ..Self::new(key, device_path)
        }
    }

    /// Parameter string for this spec, with the discard flag overridden.
    pub fn parameters(&self, allow_discards: bool) -> SecureBytes {
        DevmapperTable::crypt_create_parameters(
            &self.cipher,
            &self.key,
            self.iv_offset,
            &self.device_path,
            self.device_offset,
            allow_discards,
        )
    }

    /// Single-row crypt table spanning `sectors`.
    pub fn table(&self, sectors: u64, allow_discards: bool) -> DevmapperTable {
        DevmapperTable::new(0, sectors, CRYPT_TARGET, self.parameters(allow_discards))
    }
}

// Matches C `isspace` in the "C" locale, which includes vertical tab.
fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn skip_space(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_space(bytes[pos]) {
        pos += 1;
    }
    pos
}

/// Bounds of the next whitespace-delimited token at or after `pos`.
fn next_token(bytes: &[u8], pos: usize) -> Option<(usize, usize)> {
    let from = skip_space(bytes, pos);
    if from == bytes.len() {
        return None;
    }
    let to = bytes[from..]
        .iter()
        .position(|byte| is_space(*byte))
        .map_or(bytes.len(), |offset| from + offset);
    Some((from, to))
}

fn parse_u64(token: &[u8], field: &'static str) -> Result<u64, TableParseError> {
    std::str::from_utf8(token)
        .ok()
        .filter(|digits| digits.bytes().all(|byte| byte.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .ok_or(TableParseError::InvalidNumber { field })
}

//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The first TLS record sent by a client is read off the stream in full and
//! parsed to recover the requested hostname. The record is never decrypted
//! or modified; the exact consumed bytes are handed back so the relay can
//! replay them to the backend.
//!
//! TLS record layout:
//! - byte 0: content type (0x16 = Handshake)
//! - bytes 1-2: record version (must be at least 3.1)
//! - bytes 3-4: record body length (big-endian)
//! - body: handshake message
//!
//! ClientHello body layout:
//! - 1 byte: handshake type (0x01 = ClientHello)
//! - 3 bytes: handshake length
//! - 2 bytes: client version
//! - 32 bytes: random
//! - 1-byte length + session ID
//! - 2-byte length + cipher suites
//! - 1-byte length + compression methods
//! - 2 bytes: extensions length
//! - extensions: (type u16, length u16, data)*

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Length of the TLS record header (type + version + length).
pub const RECORD_HEADER_LEN: usize = 5;

/// Default timeout for reading the ClientHello record.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Handshake length (3) + client version (2) + random (32).
const CLIENT_HELLO_FIXED_LEN: usize = 3 + 2 + 32;

/// Reasons a byte sequence did not yield an SNI hostname.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SniError {
    /// First byte is not the TLS handshake content type.
    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotTls(u8),

    /// Record version predates TLS 1.0.
    #[error("record version {major}.{minor} is older than TLS 1.0")]
    VersionTooOld { major: u8, minor: u8 },

    /// A field or declared length runs past the end of the input.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Handshake message is not a ClientHello.
    #[error("handshake type {0:#04x} is not ClientHello")]
    NotClientHello(u8),

    /// ClientHello ends before the extensions block.
    #[error("ClientHello has no extensions block")]
    NoExtensions,

    /// server_name entry is not of type host_name.
    #[error("server_name entry type {0} is not host_name")]
    NotHostname(u8),

    /// Extensions exhausted without a server_name host.
    #[error("no server_name hostname in ClientHello")]
    NoHostnameFound,

    /// host_name bytes are not valid UTF-8.
    #[error("server_name hostname is not valid UTF-8")]
    InvalidHostname,
}

impl SniError {
    /// Stable reason code for log fields and counters.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SniError::NotTls(_) => "not_tls",
            SniError::VersionTooOld { .. } => "version_too_old",
            SniError::Truncated { .. } => "truncated",
            SniError::NotClientHello(_) => "not_client_hello",
            SniError::NoExtensions => "no_extensions",
            SniError::NotHostname(_) => "not_hostname",
            SniError::NoHostnameFound => "no_hostname_found",
            SniError::InvalidHostname => "invalid_hostname",
        }
    }
}

/// Bounded reader over untrusted bytes.
///
/// Every field read goes through [`Cursor::take`], so the position can never
/// move past the end of the buffer.
#[derive(Debug)]
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        let bytes = self
            .pos
            .checked_add(n)
            .and_then(|end| self.buf.get(self.pos..end))
            .ok_or(SniError::Truncated {
                needed: n,
                available: self.remaining(),
            })?;
        self.pos += n;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SniError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, SniError> {
        let [b] = self.read_array::<1>()?;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, SniError> {
        Ok(u16::from_be_bytes(self.read_array::<2>()?))
    }

    fn read_u8_prefixed(&mut self) -> Result<&'a [u8], SniError> {
        let len = self.read_u8()? as usize;
        self.take(len)
    }

    fn read_u16_prefixed(&mut self) -> Result<&'a [u8], SniError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }
}

/// Parsed TLS record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Record version as (major, minor).
    pub version: (u8, u8),
    /// Declared body length.
    pub length: u16,
}

impl RecordHeader {
    /// Parse and validate a record header from the start of `bytes`.
    ///
    /// Fields are checked in wire order, so a non-TLS first byte is rejected
    /// without looking at anything after it.
    pub fn parse(bytes: &[u8]) -> Result<Self, SniError> {
        Self::read(&mut Cursor::new(bytes))
    }

    fn read(cursor: &mut Cursor<'_>) -> Result<Self, SniError> {
        check_content_type(cursor.read_u8()?)?;
        let [major, minor] = cursor.read_array::<2>()?;
        check_version(major, minor)?;
        let length = cursor.read_u16()?;
        Ok(Self {
            version: (major, minor),
            length,
        })
    }
}

fn check_content_type(content_type: u8) -> Result<(), SniError> {
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotTls(content_type));
    }
    Ok(())
}

fn check_version(major: u8, minor: u8) -> Result<(), SniError> {
    if major < 3 || (major == 3 && minor < 1) {
        return Err(SniError::VersionTooOld { major, minor });
    }
    Ok(())
}

/// Extract the SNI hostname from a buffer holding a complete TLS record.
///
/// Bytes after the declared record body are ignored.
pub fn extract_sni(data: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(data);
    let header = RecordHeader::read(&mut cursor)?;
    let body = cursor.take(header.length as usize)?;
    parse_client_hello(body)
}

/// Extract the SNI hostname from a handshake record body.
///
/// Returns the hostname exactly as sent (no case folding).
pub fn parse_client_hello(body: &[u8]) -> Result<String, SniError> {
    let mut cursor = Cursor::new(body);

    let handshake_type = cursor.read_u8()?;
    if handshake_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(SniError::NotClientHello(handshake_type));
    }

    cursor.skip(CLIENT_HELLO_FIXED_LEN)?;
    cursor.read_u8_prefixed()?; // session ID
    cursor.read_u16_prefixed()?; // cipher suites

    let compression_len = cursor.read_u8()? as usize;
    if cursor.skip(compression_len).is_err() {
        return Err(SniError::NoExtensions);
    }

    // No room for an extensions block: nothing to scan.
    if cursor.remaining() < 2 {
        return Err(SniError::NoHostnameFound);
    }

    // Extensions block length; the loop below is bounded by the body instead.
    cursor.skip(2)?;

    while !cursor.is_empty() {
        let ext_type = cursor.read_u16()?;
        let data = cursor.read_u16_prefixed()?;

        if ext_type == EXTENSION_SERVER_NAME {
            if let Some(hostname) = parse_server_name(data)? {
                return Ok(hostname);
            }
        }
    }

    Err(SniError::NoHostnameFound)
}

/// Parse server_name extension data, assuming a single list entry.
///
/// An empty host_name yields `None` so the caller keeps scanning.
fn parse_server_name(data: &[u8]) -> Result<Option<String>, SniError> {
    let mut cursor = Cursor::new(data);

    cursor.skip(2)?; // server name list length

    let name_type = cursor.read_u8()?;
    if name_type != NAME_TYPE_HOST_NAME {
        return Err(SniError::NotHostname(name_type));
    }

    let name = cursor.read_u16_prefixed()?;
    if name.is_empty() {
        return Ok(None);
    }

    std::str::from_utf8(name)
        .map(|hostname| Some(hostname.to_owned()))
        .map_err(|_| SniError::InvalidHostname)
}

/// The first TLS record read from a client, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloRecord {
    header: [u8; RECORD_HEADER_LEN],
    body: Vec<u8>,
}

impl ClientHelloRecord {
    /// Record body (the handshake message).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total bytes consumed from the client (header plus body).
    pub fn prefix_len(&self) -> usize {
        RECORD_HEADER_LEN + self.body.len()
    }

    /// Header and body exactly as read, for replay to the backend.
    pub fn to_prefix(&self) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(self.prefix_len());
        prefix.extend_from_slice(&self.header);
        prefix.extend_from_slice(&self.body);
        prefix
    }

    /// Parse the SNI hostname out of the buffered body.
    pub fn server_name(&self) -> Result<String, SniError> {
        parse_client_hello(&self.body)
    }
}

/// Failure while reading the ClientHello record off a stream.
#[derive(Debug, Error)]
pub enum InspectError {
    /// Read failed or the peer closed before the record was complete.
    #[error("read client hello: {0}")]
    Io(#[from] io::Error),

    /// Record did not arrive within the handshake timeout.
    #[error("read client hello: timed out after {0:?}")]
    Timeout(Duration),

    /// Record header is not an acceptable TLS handshake header.
    #[error(transparent)]
    Invalid(#[from] SniError),
}

/// Configuration for ClientHello inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for the full record; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

/// Reads the ClientHello record from client streams.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    /// Create a new inspector with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new inspector with custom configuration.
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Read exactly one TLS record (header plus declared body) from `stream`.
    ///
    /// Nothing beyond the record is consumed. Partial reads are retried until
    /// the declared length is satisfied; EOF before that is an error.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
    ) -> Result<ClientHelloRecord, InspectError> {
        match self.config.timeout {
            Some(limit) => timeout(limit, read_record(stream))
                .await
                .map_err(|_| InspectError::Timeout(limit))?,
            None => read_record(stream).await,
        }
    }
}

async fn read_record<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<ClientHelloRecord, InspectError> {
    let mut header = [0u8; RECORD_HEADER_LEN];

    stream.read_exact(&mut header[..1]).await?;
    check_content_type(header[0])?;

    stream.read_exact(&mut header[1..3]).await?;
    check_version(header[1], header[2])?;

    stream.read_exact(&mut header[3..]).await?;
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    debug!(record_len = length, "ClientHello record buffered");

    Ok(ClientHelloRecord { header, body })
}

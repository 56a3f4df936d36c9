//! Client and server packets.
//!
//! Every packet starts with a uvarint tag. Fields introduced by later protocol revisions are
//! only present when the negotiated revision is at least the one in [`revision`].

use std::fmt;

use uuid::Uuid;

use super::binary::{Decoder, Encoder};
use super::block::Block;
use super::compress::Compressor;
use crate::error::{Error, Exception, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

pub const CLIENT_NAME: &str = "protonkit";
pub const CLIENT_VERSION_MAJOR: u64 = 2;
pub const CLIENT_VERSION_MINOR: u64 = 0;
pub const CLIENT_VERSION_PATCH: u64 = 0;
pub const DEFAULT_PORT: u16 = 8463;

/// Protocol revisions that gate optional fields.
pub mod revision {
    /// Revision this client speaks.
    pub const CLIENT: u64 = 54451;
    /// Oldest server revision accepted at handshake.
    pub const MIN_SERVER: u64 = 54032;

    pub const TEMPORARY_TABLES: u64 = 50264;
    pub const TOTAL_ROWS_IN_PROGRESS: u64 = 51554;
    pub const BLOCK_INFO: u64 = 51903;
    pub const CLIENT_INFO: u64 = 54032;
    pub const SERVER_TIMEZONE: u64 = 54058;
    pub const QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
    pub const SERVER_DISPLAY_NAME: u64 = 54372;
    pub const VERSION_PATCH: u64 = 54401;
    pub const SERVER_LOGS: u64 = 54406;
    pub const CLIENT_WRITE_INFO: u64 = 54420;
    pub const SETTINGS_AS_STRINGS: u64 = 54429;
    pub const INTERSERVER_SECRET: u64 = 54441;
    pub const OPENTELEMETRY: u64 = 54442;
    pub const DISTRIBUTED_DEPTH: u64 = 54448;
    pub const INITIAL_QUERY_START_TIME: u64 = 54449;
}

/// Tags of packets sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ClientPacket {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

impl ClientPacket {
    pub fn encode(self, encoder: &mut Encoder) {
        encoder.uvarint(self as u64);
    }
}

/// Tags of packets sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ServerPacket {
    Hello = 0,
    Data = 1,
    Exception = 2,
    Progress = 3,
    Pong = 4,
    EndOfStream = 5,
    ProfileInfo = 6,
    Totals = 7,
    Extremes = 8,
    TablesStatus = 9,
    Log = 10,
    TableColumns = 11,
    PartUuids = 12,
    ReadTaskRequest = 13,
    ProfileEvents = 14,
}

impl ServerPacket {
    pub fn from_code(code: u64) -> Option<Self> {
        use ServerPacket::*;
        Some(match code {
            0 => Hello,
            1 => Data,
            2 => Exception,
            3 => Progress,
            4 => Pong,
            5 => EndOfStream,
            6 => ProfileInfo,
            7 => Totals,
            8 => Extremes,
            9 => TablesStatus,
            10 => Log,
            11 => TableColumns,
            12 => PartUuids,
            13 => ReadTaskRequest,
            14 => ProfileEvents,
            _ => return None,
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// First packet of a session.
#[derive(Debug, Clone)]
pub struct ClientHello<'a> {
    pub database: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

impl ClientHello<'_> {
    pub fn encode(&self, encoder: &mut Encoder) {
        ClientPacket::Hello.encode(encoder);
        encoder.string(CLIENT_NAME);
        encoder.uvarint(CLIENT_VERSION_MAJOR);
        encoder.uvarint(CLIENT_VERSION_MINOR);
        encoder.uvarint(revision::CLIENT);
        encoder.string(self.database);
        encoder.string(self.username);
        encoder.string(self.password);
    }
}

/// Server identity received at handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHandshake {
    pub name: String,
    pub display_name: String,
    pub revision: u64,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub timezone: Option<String>,
}

/// Alias kept for callers asking the pool for its server version.
pub type ServerVersion = ServerHandshake;

impl ServerHandshake {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let mut hello = ServerHandshake {
            name: decoder.string()?,
            major: decoder.uvarint()?,
            minor: decoder.uvarint()?,
            revision: decoder.uvarint()?,
            ..Default::default()
        };
        if hello.revision >= revision::SERVER_TIMEZONE {
            hello.timezone = Some(decoder.string()?);
        }
        if hello.revision >= revision::SERVER_DISPLAY_NAME {
            hello.display_name = decoder.string()?;
        }
        hello.patch = if hello.revision >= revision::VERSION_PATCH {
            decoder.uvarint()?
        } else {
            hello.revision
        };
        Ok(hello)
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.uvarint(ServerPacket::Hello as u64);
        encoder.string(&self.name);
        encoder.uvarint(self.major);
        encoder.uvarint(self.minor);
        encoder.uvarint(self.revision);
        if self.revision >= revision::SERVER_TIMEZONE {
            encoder.string(self.timezone.as_deref().unwrap_or("UTC"));
        }
        if self.revision >= revision::SERVER_DISPLAY_NAME {
            encoder.string(&self.display_name);
        }
        if self.revision >= revision::VERSION_PATCH {
            encoder.uvarint(self.patch);
        }
    }
}

impl fmt::Display for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}.{} ({})",
            self.name, self.major, self.minor, self.patch, self.revision
        )
    }
}

// ============================================================================
// Query
// ============================================================================

/// Processing stage requested from the server.
const STAGE_COMPLETE: u64 = 2;

/// A query packet, including the client info section.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    pub id: &'a str,
    pub body: &'a str,
    pub quota_key: &'a str,
    pub settings: &'a [(String, String)],
    pub compression: bool,
    pub os_user: &'a str,
    pub hostname: &'a str,
}

impl Query<'_> {
    pub fn encode(&self, encoder: &mut Encoder, revision: u64) {
        ClientPacket::Query.encode(encoder);
        encoder.string(self.id);
        if revision >= revision::CLIENT_INFO {
            self.encode_client_info(encoder, revision);
        }
        if revision >= revision::SETTINGS_AS_STRINGS {
            for (name, value) in self.settings {
                encoder.string(name);
                encoder.uvarint(0);
                encoder.string(value);
            }
        }
        encoder.string("");
        if revision >= revision::INTERSERVER_SECRET {
            encoder.string("");
        }
        encoder.uvarint(STAGE_COMPLETE);
        encoder.bool(self.compression);
        encoder.string(self.body);
    }

    fn encode_client_info(&self, encoder: &mut Encoder, revision: u64) {
        // Initial query, issued by this client.
        encoder.u8(1);
        encoder.string("");
        encoder.string("");
        encoder.string("0.0.0.0:0");
        if revision >= revision::INITIAL_QUERY_START_TIME {
            encoder.i64(0);
        }
        // TCP interface.
        encoder.u8(1);
        encoder.string(self.os_user);
        encoder.string(self.hostname);
        encoder.string(CLIENT_NAME);
        encoder.uvarint(CLIENT_VERSION_MAJOR);
        encoder.uvarint(CLIENT_VERSION_MINOR);
        encoder.uvarint(revision::CLIENT);
        if revision >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            encoder.string(self.quota_key);
        }
        if revision >= revision::DISTRIBUTED_DEPTH {
            encoder.uvarint(0);
        }
        if revision >= revision::VERSION_PATCH {
            encoder.uvarint(CLIENT_VERSION_PATCH);
        }
        if revision >= revision::OPENTELEMETRY {
            // No trace context.
            encoder.u8(0);
        }
    }
}

/// Write a Data packet carrying `block`, compressed when a codec is given.
pub fn encode_data(
    encoder: &mut Encoder,
    block: &Block,
    revision: u64,
    compressor: Option<&dyn Compressor>,
) -> Result<()> {
    ClientPacket::Data.encode(encoder);
    if revision >= revision::TEMPORARY_TABLES {
        encoder.string("");
    }
    match compressor {
        Some(compressor) => {
            encoder.start_compression();
            block.encode(encoder, revision);
            encoder.end_compression(compressor)
        }
        None => {
            block.encode(encoder, revision);
            Ok(())
        }
    }
}

// ============================================================================
// Server side-channel payloads
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub rows: u64,
    pub bytes: u64,
    pub total_rows: u64,
    pub wrote_rows: u64,
    pub wrote_bytes: u64,
}

impl Progress {
    fn decode(decoder: &mut Decoder<'_>, revision: u64) -> Result<Self> {
        let mut progress = Progress {
            rows: decoder.uvarint()?,
            bytes: decoder.uvarint()?,
            ..Default::default()
        };
        if revision >= revision::TOTAL_ROWS_IN_PROGRESS {
            progress.total_rows = decoder.uvarint()?;
        }
        if revision >= revision::CLIENT_WRITE_INFO {
            progress.wrote_rows = decoder.uvarint()?;
            progress.wrote_bytes = decoder.uvarint()?;
        }
        Ok(progress)
    }

    pub fn encode(&self, encoder: &mut Encoder, revision: u64) {
        encoder.uvarint(ServerPacket::Progress as u64);
        encoder.uvarint(self.rows);
        encoder.uvarint(self.bytes);
        if revision >= revision::TOTAL_ROWS_IN_PROGRESS {
            encoder.uvarint(self.total_rows);
        }
        if revision >= revision::CLIENT_WRITE_INFO {
            encoder.uvarint(self.wrote_rows);
            encoder.uvarint(self.wrote_bytes);
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[progress] rows={}, bytes={}, total rows={}, wrote rows={}, wrote bytes={}",
            self.rows, self.bytes, self.total_rows, self.wrote_rows, self.wrote_bytes
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        Ok(ProfileInfo {
            rows: decoder.uvarint()?,
            blocks: decoder.uvarint()?,
            bytes: decoder.uvarint()?,
            applied_limit: decoder.bool()?,
            rows_before_limit: decoder.uvarint()?,
            calculated_rows_before_limit: decoder.bool()?,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.uvarint(ServerPacket::ProfileInfo as u64);
        encoder.uvarint(self.rows);
        encoder.uvarint(self.blocks);
        encoder.uvarint(self.bytes);
        encoder.bool(self.applied_limit);
        encoder.uvarint(self.rows_before_limit);
        encoder.bool(self.calculated_rows_before_limit);
    }
}

impl fmt::Display for ProfileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[profile info] rows={}, blocks={}, bytes={}, applied limit={}, rows before limit={}, calculated rows before limit={}",
            self.rows,
            self.blocks,
            self.bytes,
            self.applied_limit,
            self.rows_before_limit,
            self.calculated_rows_before_limit
        )
    }
}

fn decode_exception(decoder: &mut Decoder<'_>) -> Result<Exception> {
    let mut chain = Vec::new();
    loop {
        let code = decoder.i32()?;
        let name = decoder.string()?;
        let message = decoder.string()?;
        let stack_trace = decoder.string()?;
        let nested = decoder.bool()?;
        chain.push(Exception {
            code,
            name,
            message,
            stack_trace,
            nested: None,
        });
        if !nested {
            break;
        }
    }
    // Link innermost first so the outermost ends up on top.
    let mut exception = chain.pop().ok_or_else(|| Error::protocol("empty exception"))?;
    while let Some(mut outer) = chain.pop() {
        outer.nested = Some(Box::new(exception));
        exception = outer;
    }
    Ok(exception)
}

/// Encode an exception chain the way the server sends it.
pub fn encode_exception(encoder: &mut Encoder, exception: &Exception) {
    encoder.uvarint(ServerPacket::Exception as u64);
    let mut current = Some(exception);
    while let Some(e) = current {
        encoder.i32(e.code);
        encoder.string(&e.name);
        encoder.string(&e.message);
        encoder.string(&e.stack_trace);
        encoder.bool(e.nested.is_some());
        current = e.nested.as_deref();
    }
}

// ============================================================================
// Server packets
// ============================================================================

/// A fully decoded server packet.
#[derive(Debug)]
pub enum Packet {
    Hello(ServerHandshake),
    Data(Block),
    Exception(Exception),
    Progress(Progress),
    Pong,
    EndOfStream,
    ProfileInfo(ProfileInfo),
    Totals(Block),
    Extremes(Block),
    Log(Block),
    TableColumns { table: String, description: String },
    PartUuids(Vec<Uuid>),
    ReadTaskRequest,
    ProfileEvents(Block),
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Hello(_) => "Hello",
            Packet::Data(_) => "Data",
            Packet::Exception(_) => "Exception",
            Packet::Progress(_) => "Progress",
            Packet::Pong => "Pong",
            Packet::EndOfStream => "EndOfStream",
            Packet::ProfileInfo(_) => "ProfileInfo",
            Packet::Totals(_) => "Totals",
            Packet::Extremes(_) => "Extremes",
            Packet::Log(_) => "Log",
            Packet::TableColumns { .. } => "TableColumns",
            Packet::PartUuids(_) => "PartUUIDs",
            Packet::ReadTaskRequest => "ReadTaskRequest",
            Packet::ProfileEvents(_) => "ProfileEvents",
        }
    }

    /// Decode one packet. `compressor` applies to Data, Totals and Extremes blocks only.
    pub fn decode<'a>(
        decoder: &mut Decoder<'a>,
        revision: u64,
        compressor: Option<&'a dyn Compressor>,
    ) -> Result<Self> {
        let code = decoder.uvarint()?;
        let kind = ServerPacket::from_code(code)
            .ok_or_else(|| Error::protocol(format!("unknown server packet {}", code)))?;
        Ok(match kind {
            ServerPacket::Hello => Packet::Hello(ServerHandshake::decode(decoder)?),
            ServerPacket::Data => Packet::Data(decode_block(decoder, revision, compressor)?),
            ServerPacket::Totals => Packet::Totals(decode_block(decoder, revision, compressor)?),
            ServerPacket::Extremes => {
                Packet::Extremes(decode_block(decoder, revision, compressor)?)
            }
            ServerPacket::Log => Packet::Log(decode_block(decoder, revision, None)?),
            ServerPacket::ProfileEvents => {
                Packet::ProfileEvents(decode_block(decoder, revision, None)?)
            }
            ServerPacket::Exception => Packet::Exception(decode_exception(decoder)?),
            ServerPacket::Progress => Packet::Progress(Progress::decode(decoder, revision)?),
            ServerPacket::ProfileInfo => Packet::ProfileInfo(ProfileInfo::decode(decoder)?),
            ServerPacket::Pong => Packet::Pong,
            ServerPacket::EndOfStream => Packet::EndOfStream,
            ServerPacket::TableColumns => Packet::TableColumns {
                table: decoder.string()?,
                description: decoder.string()?,
            },
            ServerPacket::PartUuids => {
                let n = decoder.length()?;
                let mut uuids = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let high = decoder.u64()?;
                    let low = decoder.u64()?;
                    uuids.push(Uuid::from_u64_pair(high, low));
                }
                Packet::PartUuids(uuids)
            }
            ServerPacket::ReadTaskRequest => Packet::ReadTaskRequest,
            ServerPacket::TablesStatus => {
                return Err(Error::protocol("unexpected TablesStatus packet"))
            }
        })
    }
}

fn decode_block<'a>(
    decoder: &mut Decoder<'a>,
    revision: u64,
    compressor: Option<&'a dyn Compressor>,
) -> Result<Block> {
    if revision >= revision::TEMPORARY_TABLES {
        decoder.string()?;
    }
    match compressor {
        Some(compressor) => {
            decoder.start_decompression(compressor);
            let block = Block::decode(decoder, revision)?;
            decoder.end_decompression()?;
            Ok(block)
        }
        None => Block::decode(decoder, revision),
    }
}

/// Write a server-side Data packet. Used by tests that play the server.
pub fn encode_server_data(
    encoder: &mut Encoder,
    kind: ServerPacket,
    block: &Block,
    revision: u64,
) {
    encoder.uvarint(kind as u64);
    if revision >= revision::TEMPORARY_TABLES {
        encoder.string("");
    }
    block.encode(encoder, revision);
}

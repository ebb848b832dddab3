//! Control messages: line 1 is the command, each following line a parameter.
//!
//! Lines are joined with `\r\n` on encode and split on `\n` (then trimmed) on parse.

use std::fmt;

/// Logical name of the connection to the directory server.
pub const DIRECTORY_CONNECTION: &str = "central_server";

/// Sentinel used by the directory for every field of an unknown-file lookup.
pub const NULL_SENTINEL: &str = "NULL";

/// Notice written to an inbound connection refused because the table is full.
pub const BUSY_NOTICE: &str = "Server is too busy, please try again later\r\n";

pub mod command {
    pub const ADD_FILES: &str = "addFiles";
    pub const LIST: &str = "list";
    pub const GET_FILE: &str = "getFile";
    pub const FILE_ADDRESS: &str = "fileAddress";
    pub const FILE_REQUEST: &str = "fileRequest";
    pub const FILE_TRANSFER: &str = crate::wire::TRANSFER_TAG;
}

/// `host:port` pair as carried in `addFiles` and `fileAddress`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or(ProtocolError::Malformed("address is not host:port"))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| ProtocolError::Malformed("address port is not a number"))?;
        if host.trim().is_empty() {
            return Err(ProtocolError::Malformed("address host is empty"));
        }
        Ok(Self::new(host.trim(), port))
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One `name\tsize\tpath` line of an `addFiles` announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub name: String,
    pub size: u64,
    pub path: String,
}

/// Directory answer to `getFile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    Found {
        file_id: u32,
        name: String,
        size: u64,
        peers: Vec<PeerEndpoint>,
    },
    /// Every field was the `NULL` sentinel: no seeders.
    NotFound,
}

/// Typed control message. Chunk frames are handled by the `wire` module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    AddFiles {
        endpoint: PeerEndpoint,
        files: Vec<SharedFile>,
    },
    List,
    GetFile {
        file_id: u32,
    },
    FileAddress(FileLookup),
    FileRequest {
        file_id: u32,
        name: String,
        size: u64,
        start: u32,
        count: u32,
    },
}

/// First line of a message, trimmed. Used to classify traffic before full parsing.
pub fn command_of(text: &str) -> &str {
    text.split('\n').next().unwrap_or("").trim()
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let lines: Vec<&str> = text.split('\n').map(str::trim).collect();
        let command = match lines.first() {
            Some(c) if !c.is_empty() => *c,
            _ => return Err(ProtocolError::Empty),
        };
        let params = &lines[1..];
        match command {
            command::ADD_FILES => {
                let endpoint = PeerEndpoint::parse(param(params, 0, "addFiles endpoint")?)?;
                let files = params[1..]
                    .iter()
                    .filter(|l| !l.is_empty())
                    .map(|l| parse_shared_file(l))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ControlMessage::AddFiles { endpoint, files })
            }
            command::LIST => Ok(ControlMessage::List),
            command::GET_FILE => Ok(ControlMessage::GetFile {
                file_id: number(param(params, 0, "getFile id")?, "getFile id")?,
            }),
            command::FILE_ADDRESS => parse_file_address(params).map(ControlMessage::FileAddress),
            command::FILE_REQUEST => Ok(ControlMessage::FileRequest {
                file_id: number(param(params, 0, "fileRequest id")?, "fileRequest id")?,
                name: param(params, 1, "fileRequest name")?.to_string(),
                size: number(param(params, 2, "fileRequest size")?, "fileRequest size")?,
                start: number(param(params, 3, "fileRequest start")?, "fileRequest start")?,
                count: number(param(params, 4, "fileRequest count")?, "fileRequest count")?,
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ControlMessage::AddFiles { endpoint, files } => {
                let mut out = format!("{}\r\n{}\r\n", command::ADD_FILES, endpoint);
                for f in files {
                    out.push_str(&format!("{}\t{}\t{}\r\n", f.name, f.size, f.path));
                }
                out
            }
            ControlMessage::List => command::LIST.to_string(),
            ControlMessage::GetFile { file_id } => format!("{}\r\n{}", command::GET_FILE, file_id),
            ControlMessage::FileAddress(FileLookup::NotFound) => format!(
                "{}\r\n{n}\r\n{n}\r\n{n}\r\n{n}",
                command::FILE_ADDRESS,
                n = NULL_SENTINEL
            ),
            ControlMessage::FileAddress(FileLookup::Found {
                file_id,
                name,
                size,
                peers,
            }) => {
                let mut out = format!("{}\r\n{}\r\n{}\r\n{}", command::FILE_ADDRESS, file_id, name, size);
                for p in peers {
                    out.push_str(&format!("\r\n{}", p));
                }
                out
            }
            ControlMessage::FileRequest {
                file_id,
                name,
                size,
                start,
                count,
            } => format!(
                "{}\r\n{}\r\n{}\r\n{}\r\n{}\r\n{}",
                command::FILE_REQUEST,
                file_id,
                name,
                size,
                start,
                count
            ),
        }
    }
}

fn param<'a>(params: &[&'a str], i: usize, what: &'static str) -> Result<&'a str, ProtocolError> {
    params
        .get(i)
        .copied()
        .ok_or(ProtocolError::MissingField(what))
}

fn number<T: std::str::FromStr>(s: &str, what: &'static str) -> Result<T, ProtocolError> {
    s.trim().parse().map_err(|_| ProtocolError::Malformed(what))
}

fn parse_shared_file(line: &str) -> Result<SharedFile, ProtocolError> {
    let mut parts = line.split('\t');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or(ProtocolError::MissingField("addFiles name"))?;
    let size = number(
        parts.next().ok_or(ProtocolError::MissingField("addFiles size"))?,
        "addFiles size",
    )?;
    let path = parts.next().ok_or(ProtocolError::MissingField("addFiles path"))?;
    Ok(SharedFile {
        name: name.trim().to_string(),
        size,
        path: path.trim().to_string(),
    })
}

fn parse_file_address(params: &[&str]) -> Result<FileLookup, ProtocolError> {
    let id = param(params, 0, "fileAddress id")?;
    if id == NULL_SENTINEL {
        return Ok(FileLookup::NotFound);
    }
    let file_id = number(id, "fileAddress id")?;
    let name = param(params, 1, "fileAddress name")?.to_string();
    let size = number(param(params, 2, "fileAddress size")?, "fileAddress size")?;
    let peers = params[3.min(params.len())..]
        .iter()
        .filter(|l| !l.is_empty() && **l != NULL_SENTINEL)
        .map(|l| PeerEndpoint::parse(l))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FileLookup::Found {
        file_id,
        name,
        size,
        peers,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty control message")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed control message: missing {0}")]
    MissingField(&'static str),
    #[error("malformed control message: {0}")]
    Malformed(&'static str),
}

//! D-Bus SASL authentication handling.
//!
//! Only the EXTERNAL mechanism is offered: the client proves who it is with
//! the credentials of the Unix socket. [`SaslServer`] and [`SaslClient`] are
//! plain state machines fed one line at a time; [`authenticate`] and
//! [`authenticate_client`] drive them over a stream.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{AuthError, Result};

/// Longest handshake line accepted, terminator included.
pub const MAX_LINE: usize = 16 * 1024;

const REJECTED: &str = "REJECTED EXTERNAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Init,
    WaitForAuth,
    WaitForData,
    WaitForBegin,
    Done,
}

/// Server side of the handshake.
#[derive(Debug)]
pub struct SaslServer {
    state: ServerState,
    uid: u32,
    guid: String,
    supports_unix_fd: bool,
    unix_fd: bool,
}

impl SaslServer {
    /// `uid` is the socket credential, `guid` the raw server id.
    pub fn new(uid: u32, guid: &[u8]) -> Self {
        Self {
            state: ServerState::Init,
            uid,
            guid: hex::encode(guid),
            supports_unix_fd: true,
            unix_fd: false,
        }
    }

    /// Whether `NEGOTIATE_UNIX_FD` is agreed to.
    pub fn with_unix_fd(mut self, supported: bool) -> Self {
        self.supports_unix_fd = supported;
        self
    }

    pub fn is_done(&self) -> bool {
        self.state == ServerState::Done
    }

    /// Descriptor passing was negotiated.
    pub fn unix_fd(&self) -> bool {
        self.unix_fd
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Process one line, without its `\r\n`.
    ///
    /// Returns the reply line to send, if any. The first line must start
    /// with the NUL byte.
    pub fn dispatch(&mut self, line: &[u8]) -> std::result::Result<Option<String>, AuthError> {
        let line = match self.state {
            ServerState::Init => {
                let Some((0, rest)) = line.split_first().map(|(b, r)| (*b, r)) else {
                    return Err(AuthError::ExpectedNullByte);
                };
                self.state = ServerState::WaitForAuth;
                rest
            }
            ServerState::Done => {
                return Err(AuthError::UnexpectedLine(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
            _ => line,
        };
        let line = std::str::from_utf8(line)
            .map_err(|_| AuthError::UnexpectedLine(String::from_utf8_lossy(line).into_owned()))?;
        let (command, argument) = match line.split_once(' ') {
            Some((command, argument)) => (command, Some(argument)),
            None => (line, None),
        };

        let reply = match (self.state, command) {
            (_, "CANCEL") | (_, "ERROR") => self.reject(),
            (ServerState::WaitForAuth, "AUTH") => self.handle_auth(argument),
            (ServerState::WaitForData, "DATA") => self.handle_data(argument),
            (ServerState::WaitForBegin, "NEGOTIATE_UNIX_FD") => {
                if self.supports_unix_fd {
                    self.unix_fd = true;
                    Some("AGREE_UNIX_FD".to_string())
                } else {
                    Some("ERROR".to_string())
                }
            }
            (ServerState::WaitForBegin, "BEGIN") => {
                self.state = ServerState::Done;
                None
            }
            _ => Some("ERROR".to_string()),
        };
        Ok(reply)
    }

    fn reject(&mut self) -> Option<String> {
        self.state = ServerState::WaitForAuth;
        Some(REJECTED.to_string())
    }

    fn handle_auth(&mut self, argument: Option<&str>) -> Option<String> {
        let (mechanism, data) = match argument {
            Some(argument) => match argument.split_once(' ') {
                Some((mechanism, data)) => (mechanism, Some(data)),
                None => (argument, None),
            },
            None => ("", None),
        };

        if mechanism != "EXTERNAL" {
            if !mechanism.is_empty() {
                warn!(mechanism = %mechanism, "Unsupported auth mechanism");
            }
            return self.reject();
        }

        match data {
            Some(data) => self.verify(data),
            None => {
                self.state = ServerState::WaitForData;
                Some("DATA".to_string())
            }
        }
    }

    fn handle_data(&mut self, argument: Option<&str>) -> Option<String> {
        match argument {
            Some(data) if !data.is_empty() => self.verify(data),
            _ => {
                debug!(uid = self.uid, "EXTERNAL auth with empty DATA (using socket UID)");
                self.accept()
            }
        }
    }

    fn verify(&mut self, data: &str) -> Option<String> {
        match parse_hex_uid(data) {
            Some(uid) if uid == self.uid => {
                debug!(uid = uid, "EXTERNAL auth with UID");
                self.accept()
            }
            claimed => {
                debug!(claimed = ?claimed, uid = self.uid, "EXTERNAL auth UID mismatch");
                self.reject()
            }
        }
    }

    fn accept(&mut self) -> Option<String> {
        self.state = ServerState::WaitForBegin;
        Some(format!("OK {}", self.guid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Init,
    WaitForData,
    WaitForOk,
    WaitForAgree,
    Done,
}

/// Client side of the handshake, pipelining the whole exchange.
#[derive(Debug)]
pub struct SaslClient {
    state: ClientState,
    server_guid: Option<String>,
    unix_fd: bool,
}

impl Default for SaslClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslClient {
    pub fn new() -> Self {
        Self {
            state: ClientState::Init,
            server_guid: None,
            unix_fd: false,
        }
    }

    /// Everything the client sends, in one go.
    pub fn start(&mut self) -> &'static [u8] {
        self.state = ClientState::WaitForData;
        b"\0AUTH EXTERNAL\r\nDATA\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n"
    }

    /// Consume one server line, without its `\r\n`.
    pub fn dispatch(&mut self, line: &str) -> std::result::Result<(), AuthError> {
        if line.starts_with("REJECTED") {
            return Err(AuthError::Rejected(line.to_string()));
        }
        match (self.state, line) {
            (ClientState::WaitForData, "DATA") => self.state = ClientState::WaitForOk,
            (ClientState::WaitForOk, _) if line.starts_with("OK ") => {
                self.server_guid = Some(line[3..].to_string());
                self.state = ClientState::WaitForAgree;
            }
            (ClientState::WaitForAgree, "AGREE_UNIX_FD") => {
                self.unix_fd = true;
                self.state = ClientState::Done;
            }
            (ClientState::WaitForAgree, _) if line == "ERROR" || line.starts_with("ERROR ") => {
                self.state = ClientState::Done;
            }
            _ => return Err(AuthError::UnexpectedLine(line.to_string())),
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.state == ClientState::Done
    }

    pub fn server_guid(&self) -> Option<&str> {
        self.server_guid.as_deref()
    }

    pub fn unix_fd(&self) -> bool {
        self.unix_fd
    }
}

/// Result of successful authentication.
#[derive(Debug)]
pub struct AuthResult {
    /// The authenticated UID.
    pub uid: u32,
    /// Descriptor passing was negotiated.
    pub unix_fd: bool,
    /// Any data that was buffered during auth but belongs to the D-Bus message stream.
    pub buffered_data: Vec<u8>,
}

/// Run the server side of the handshake on `stream`.
pub async fn authenticate<S>(stream: &mut S, mut sasl: SaslServer) -> Result<AuthResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    while !sasl.is_done() {
        let line = read_line(&mut reader).await?;
        trace!(line = %String::from_utf8_lossy(&line), "Received auth line");

        if let Some(reply) = sasl.dispatch(&line)? {
            let stream = reader.get_mut();
            stream.write_all(reply.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await?;
            trace!(reply = %reply, "Sent auth reply");
        }
    }

    debug!(uid = sasl.uid(), unix_fd = sasl.unix_fd(), "Authentication successful");

    // The client may pipeline its first messages right after BEGIN.
    let buffered_data = reader.buffer().to_vec();
    trace!(buffered_bytes = buffered_data.len(), "Returning buffered data from auth");

    Ok(AuthResult {
        uid: sasl.uid(),
        unix_fd: sasl.unix_fd(),
        buffered_data,
    })
}

/// Run the client side of the handshake on `stream`.
///
/// Returns the server GUID and any bytes read past the handshake.
pub async fn authenticate_client<S>(stream: &mut S) -> Result<(String, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sasl = SaslClient::new();
    stream.write_all(sasl.start()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    while !sasl.is_done() {
        let line = read_line(&mut reader).await?;
        let line = String::from_utf8_lossy(&line);
        trace!(line = %line, "Received auth reply");
        sasl.dispatch(&line)?;
    }

    let guid = sasl
        .server_guid()
        .ok_or_else(|| AuthError::UnexpectedLine("missing OK".to_string()))?
        .to_string();
    Ok((guid, reader.buffer().to_vec()))
}

/// Read one `\r\n`-terminated line, without the terminator.
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_LINE as u64);
    limited.read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        return Err(if line.len() >= MAX_LINE {
            AuthError::LineTooLong.into()
        } else {
            AuthError::Eof.into()
        });
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Parse a hex-encoded UID.
fn parse_hex_uid(hex: &str) -> Option<u32> {
    let bytes = hex::decode(hex).ok()?;
    let uid = std::str::from_utf8(&bytes).ok()?;
    uid.parse::<u32>().ok()
}

/// Generate a random GUID for the D-Bus server.
pub fn generate_guid() -> [u8; 16] {
    *Uuid::new_v4().as_bytes()
}

/// Encode a UID as hex for D-Bus auth.
pub fn encode_uid(uid: u32) -> String {
    hex::encode(uid.to_string().as_bytes())
}

//! Socket front end.
//!
//! The [`Broker`] accepts connections on a Unix socket. Each connection gets
//! a task that authenticates it, reads messages off the socket and forwards
//! them as [`Event`]s, plus a writer task draining the peer's outgoing
//! queue. The broker's run loop is the only place that touches the
//! [`Bus`], so routing never races with itself.

use std::collections::HashMap;
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::auth::{authenticate, SaslServer};
use crate::bus::{Bus, BusConfig};
use crate::driver::Driver;
use crate::error::{DispatchError, Error, MessageError, Result};
use crate::message::{Message, MessageHeader};
use crate::peer::{Connection, PeerCredentials};
use crate::protocol::{PeerId, HEADER_SIZE};

/// What a peer was registered as.
#[derive(Debug)]
pub struct Registration {
    pub peer_id: PeerId,
    /// Resolves once the broker drops the peer.
    pub closed: oneshot::Receiver<()>,
}

/// Connection events sent to the run loop.
#[derive(Debug)]
pub enum Event {
    /// A connection finished the handshake.
    Connected {
        credentials: PeerCredentials,
        connection: Connection,
        reply: oneshot::Sender<Registration>,
    },
    /// A complete message arrived.
    Message { peer_id: PeerId, message: Message },
    /// The connection is gone.
    Disconnected { peer_id: PeerId },
}

/// Settings each connection task needs.
#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    guid: [u8; 16],
    max_queue: usize,
    max_message_size: u64,
}

/// The broker: a listening socket and the bus behind it.
pub struct Broker {
    listener: UnixListener,
    socket_path: PathBuf,
    bus: Bus,
    driver: Driver,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    /// Dropping a peer's sender stops its reader.
    kicks: HashMap<PeerId, oneshot::Sender<()>>,
}

impl Broker {
    /// Bind the socket at `socket_path`.
    ///
    /// A stale socket file is removed and the parent directory created.
    pub fn bind(socket_path: PathBuf, config: BusConfig) -> Result<Self> {
        // Remove old socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "Listening for peer connections");

        let (events_tx, events_rx) = mpsc::channel(1024);
        Ok(Self {
            listener,
            socket_path,
            bus: Bus::new(config),
            driver: Driver::new(),
            events_tx,
            events_rx,
            kicks: HashMap::new(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Accept connections and route messages until dropped.
    pub async fn run(mut self) -> Result<()> {
        info!("Broker running");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.spawn_connection(stream),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let config = self.bus.config();
        let settings = ConnectionSettings {
            guid: config.guid,
            max_queue: config.max_queue,
            max_message_size: config.max_message_size,
        };
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, settings, events).await {
                warn!(error = %e, "Connection ended with error");
            }
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                credentials,
                connection,
                reply,
            } => {
                let peer_id = self.bus.connect(credentials, connection);
                let (kick_tx, kick_rx) = oneshot::channel();
                let registration = Registration {
                    peer_id,
                    closed: kick_rx,
                };
                if reply.send(registration).is_err() {
                    self.driver.hangup(&mut self.bus, peer_id);
                    return;
                }
                self.kicks.insert(peer_id, kick_tx);
            }
            Event::Message { peer_id, message } => {
                match self.driver.dispatch(&mut self.bus, peer_id, message) {
                    Ok(()) => {}
                    Err(DispatchError::UnknownPeer(_)) => {
                        trace!(peer_id = peer_id, "Message from departed peer");
                    }
                    Err(e) => {
                        warn!(peer_id = peer_id, error = %e, "Disconnecting peer");
                        self.disconnect(peer_id);
                    }
                }
            }
            Event::Disconnected { peer_id } => self.disconnect(peer_id),
        }
    }

    fn disconnect(&mut self, peer_id: PeerId) {
        self.kicks.remove(&peer_id);
        self.driver.hangup(&mut self.bus, peer_id);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let n = self.bus.flush_peers();
        debug!(n_peers = n, "Flushed peers");
        // Clean up socket file
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

/// Authenticate a connection, then pump its messages until it closes.
async fn handle_connection(mut stream: UnixStream, settings: ConnectionSettings, events: mpsc::Sender<Event>) -> Result<()> {
    let cred = stream.peer_cred()?;
    let pid = cred.pid().and_then(|p| u32::try_from(p).ok());
    debug!(uid = cred.uid(), pid = ?pid, "New connection");

    let sasl = SaslServer::new(cred.uid(), &settings.guid).with_unix_fd(false);
    let auth = authenticate(&mut stream, sasl).await?;

    let (connection, mut outgoing) = Connection::channel(settings.max_queue);
    let (reply_tx, reply_rx) = oneshot::channel();
    events
        .send(Event::Connected {
            credentials: PeerCredentials {
                uid: auth.uid,
                pid,
                seclabel: None,
            },
            connection: connection.with_unix_fd(auth.unix_fd),
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::Shutdown)?;
    let Registration { peer_id, mut closed } = reply_rx.await.map_err(|_| Error::Shutdown)?;

    let (read_half, write_half) = stream.into_split();

    tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                debug!(peer_id = peer_id, error = %e, "Error writing to peer");
                break;
            }
        }
        trace!(peer_id = peer_id, "Writer exiting");
    });

    // Bytes pipelined behind BEGIN come first.
    let mut reader = BufReader::new(Cursor::new(auth.buffered_data).chain(read_half));
    let result = loop {
        tokio::select! {
            _ = &mut closed => break Ok(()),
            read = read_message(&mut reader, settings.max_message_size) => match read {
                Ok(Some(message)) => {
                    if events.send(Event::Message { peer_id, message }).await.is_err() {
                        break Err(Error::Shutdown);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };

    info!(peer_id = peer_id, "Connection closed");
    // The run loop may already be gone during shutdown.
    let _ = events.send(Event::Disconnected { peer_id }).await;
    result
}

/// Read one framed message. `None` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R, max_message_size: u64) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = MessageHeader(header);
    let (_, _, n_data) = header.lengths()?;
    if n_data > max_message_size {
        return Err(MessageError::TooLarge.into());
    }

    let mut message = Message::new_incoming(header)?;
    reader.read_exact(message.tail_mut()).await?;
    Ok(Some(message))
}

/// Write a message's segments in order with vectored writes.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = message.len();
    let mut written = 0;
    while written < total {
        let slices = message.io_slices(written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(ErrorKind::WriteZero.into());
        }
        written += n;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let mut original = MessageBuilder::signal("/org/example", "org.example.Iface", "Changed")
            .body("s", &"payload")
            .unwrap()
            .build()
            .unwrap();
        original.parse_metadata().unwrap();
        original.stitch_sender(3);

        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &original).await.unwrap();
        drop(a);

        let mut received = read_message(&mut b, u64::MAX).await.unwrap().unwrap();
        assert_eq!(received.to_vec(), original.to_vec());
        let metadata = received.parse_metadata().unwrap();
        assert_eq!(metadata.fields.sender.as_deref(), Some(":1.3"));

        assert!(read_message(&mut b, u64::MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_resumes_after_short_writes() {
        let mut message = MessageBuilder::method_call("/org/example", "Call")
            .destination("org.example.Service")
            .body("ss", &("first", "second"))
            .unwrap()
            .build()
            .unwrap();
        message.parse_metadata().unwrap();
        message.stitch_sender(12);
        let expected = message.to_vec();

        // A tiny pipe forces partial writes across segment boundaries.
        let (mut a, mut b) = tokio::io::duplex(5);
        let reader = async {
            let mut received = Vec::new();
            b.read_to_end(&mut received).await.unwrap();
            received
        };
        let writer = async {
            write_message(&mut a, &message).await.unwrap();
            drop(a);
        };
        let (received, ()) = tokio::join!(reader, writer);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized() {
        let message = MessageBuilder::signal("/", "org.example.Iface", "Big")
            .body("s", &"x".repeat(256))
            .unwrap()
            .build()
            .unwrap();
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, &message).await.unwrap();

        let err = read_message(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, Error::Message(MessageError::TooLarge)));
    }
}

//! Point-to-point transport between ranks.
//!
//! Control plane: every node dials the manager's listener, identifies itself
//! with a hello frame, and exchanges typed [`CtrlMsg`] records framed as
//! `[u32 len][JSON]`. Messages are addressed by rank; the manager relays
//! frames whose destination is another node, so nodes only ever hold one
//! control connection. One TCP stream per pair gives FIFO delivery per
//! sender.
//!
//! Data plane: input, correlator and output nodes own a data listener whose
//! endpoint is advertised to the manager in the hello. The manager commands
//! the writer side of each edge to connect to the reader's endpoint; the
//! writer identifies its stream with a fixed hello, then ships framed
//! blocks. Establishment is acknowledged to the manager before any work is
//! dispatched on the edge.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::thread;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::msg::{CtrlMsg, Endpoint, SliceHeader};
use crate::time::Time;

/// Rank of the manager.
pub const RANK_MANAGER: u16 = 0;
/// Rank of the log node.
pub const RANK_LOG: u16 = 1;
/// Rank of the output node.
pub const RANK_OUTPUT: u16 = 2;

/// Rank of input node `n`.
pub fn input_rank(n: usize) -> u16 {
    3 + n as u16
}

/// Rank of correlator node `n` in a run with `n_inputs` input nodes.
pub fn correlator_rank(n: usize, n_inputs: usize) -> u16 {
    3 + (n_inputs + n) as u16
}

const CTRL_HELLO_MAGIC: u32 = 0x4658_4331; // "FXC1"
const DATA_HELLO_MAGIC: u32 = 0x4658_4431; // "FXD1"
const SLICE_MAGIC: u32 = 0x4658_5343; // "FXSC"

/// Depth of each node inbox; senders block when a node falls this far behind.
const INBOX_DEPTH: usize = 1024;

/// Errors raised in the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    /// Generic IO error
    IO(#[from] io::Error),

    /// None of a peer's advertised addresses accepted a connection
    #[error("cannot connect to {who}: no address of {addrs:?} port {port} accepted")]
    Unreachable {
        /// Description of the peer
        who: String,
        /// The addresses that were tried
        addrs: Vec<String>,
        /// The advertised port
        port: u16,
    },

    /// A peer opened a connection but did not speak the protocol
    #[error("bad hello from peer (magic {got:#010x})")]
    BadHello {
        /// The magic number received
        got: u32,
    },

    /// A control frame could not be encoded or decoded
    #[error("control message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer closed its end
    #[error("control connection to rank {rank} closed")]
    Closed {
        /// The rank whose connection went away
        rank: u16,
    },

    /// A message arrived that the receiving state cannot accept
    #[error("protocol error: unexpected message {what}")]
    Protocol {
        /// Description of the offending message
        what: String,
    },
}

/// A control message in flight, with its addressing.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sender rank
    pub from: u16,
    /// Destination rank
    pub to: u16,
    /// The message
    pub msg: CtrlMsg,
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
    stream.write_u32::<LittleEndian>(payload.len() as u32)?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, TransportError> {
    let len = match stream.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn send_envelope(stream: &mut TcpStream, envelope: &Envelope) -> Result<(), TransportError> {
    #[derive(serde::Serialize)]
    struct Wire<'a> {
        from: u16,
        to: u16,
        msg: &'a CtrlMsg,
    }
    let payload = serde_json::to_vec(&Wire {
        from: envelope.from,
        to: envelope.to,
        msg: &envelope.msg,
    })?;
    write_frame(stream, &payload)
}

fn decode_envelope(payload: &[u8]) -> Result<Envelope, TransportError> {
    #[derive(serde::Deserialize)]
    struct Wire {
        from: u16,
        to: u16,
        msg: CtrlMsg,
    }
    let wire: Wire = serde_json::from_slice(payload)?;
    Ok(Envelope {
        from: wire.from,
        to: wire.to,
        msg: wire.msg,
    })
}

/// Local addresses to advertise, in preference order. The routable address
/// first when one can be determined, loopback next, the hostname as the
/// DNS-based last resort.
pub fn local_addresses() -> Vec<String> {
    let mut addrs = Vec::new();
    // Learning the outbound interface address by "connecting" a datagram
    // socket sends no packets.
    if let Ok(sock) = UdpSocket::bind("0.0.0.0:0") {
        if sock.connect("198.51.100.1:53").is_ok() {
            if let Ok(local) = sock.local_addr() {
                let ip = local.ip().to_string();
                if ip != "0.0.0.0" {
                    addrs.push(ip);
                }
            }
        }
    }
    addrs.push("127.0.0.1".to_string());
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            addrs.push(host);
        }
    }
    addrs.dedup();
    addrs
}

/// Dial the first address of an endpoint that accepts.
fn connect_endpoint(endpoint: &Endpoint, who: &str) -> Result<TcpStream, TransportError> {
    for addr in &endpoint.addrs {
        match TcpStream::connect((addr.as_str(), endpoint.port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => trace!("connect {who} via {addr}:{} failed: {e}", endpoint.port),
        }
    }
    Err(TransportError::Unreachable {
        who: who.to_string(),
        addrs: endpoint.addrs.clone(),
        port: endpoint.port,
    })
}

fn spawn_ctrl_reader(
    rank: u16,
    mut stream: TcpStream,
    inbox: Sender<Envelope>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("ctrl-rx-{rank}"))
        .spawn(move || loop {
            match read_frame(&mut stream) {
                Ok(Some(payload)) => match decode_envelope(&payload) {
                    Ok(envelope) => {
                        if inbox.send(envelope).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("dropping undecodable control frame from rank {rank}: {e}");
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    debug!("control connection with rank {rank} errored: {e}");
                    return;
                }
            }
        })
        .expect("spawn control reader")
}

/// A node's control connection to the manager.
pub struct ControlClient {
    rank: u16,
    stream: TcpStream,
    inbox: Receiver<Envelope>,
}

impl ControlClient {
    /// Dial the manager, introduce ourselves, and start the receive thread.
    pub fn connect(
        manager: &Endpoint,
        rank: u16,
        data_endpoint: Option<Endpoint>,
    ) -> Result<Self, TransportError> {
        let mut stream = connect_endpoint(manager, "manager")?;
        stream.write_u32::<LittleEndian>(CTRL_HELLO_MAGIC)?;
        stream.write_u16::<LittleEndian>(rank)?;
        let hello = serde_json::to_vec(&data_endpoint)?;
        write_frame(&mut stream, &hello)?;
        let (tx, rx) = bounded(INBOX_DEPTH);
        spawn_ctrl_reader(RANK_MANAGER, stream.try_clone()?, tx);
        Ok(Self {
            rank,
            stream,
            inbox: rx,
        })
    }

    /// Send a message to a rank. Everything goes through the manager, which
    /// relays frames addressed elsewhere.
    pub fn send(&mut self, to: u16, msg: CtrlMsg) -> Result<(), TransportError> {
        send_envelope(
            &mut self.stream,
            &Envelope {
                from: self.rank,
                to,
                msg,
            },
        )
    }

    /// The inbox the receive thread feeds.
    pub fn inbox(&self) -> &Receiver<Envelope> {
        &self.inbox
    }
}

/// One node as the manager sees it.
struct PeerSlot {
    stream: TcpStream,
    data_endpoint: Option<Endpoint>,
}

/// The manager's side of the control plane.
pub struct ControlServer {
    peers: Vec<PeerSlot>,
    inbox: Receiver<Envelope>,
    inbox_tx: Sender<Envelope>,
}

impl ControlServer {
    /// Accept `n_nodes` control connections. Nodes may dial in any order;
    /// each slot is filed under the rank in its hello.
    pub fn accept(listener: &TcpListener, n_nodes: usize) -> Result<Self, TransportError> {
        let (tx, rx) = bounded(INBOX_DEPTH);
        let mut slots: Vec<Option<PeerSlot>> = Vec::new();
        slots.resize_with(n_nodes + 1, || None);
        for _ in 0..n_nodes {
            let (mut stream, _addr) = listener.accept()?;
            stream.set_nodelay(true)?;
            let magic = stream.read_u32::<LittleEndian>()?;
            if magic != CTRL_HELLO_MAGIC {
                return Err(TransportError::BadHello { got: magic });
            }
            let rank = stream.read_u16::<LittleEndian>()?;
            let payload = read_frame(&mut stream)?.ok_or(TransportError::Closed { rank })?;
            let data_endpoint: Option<Endpoint> = serde_json::from_slice(&payload)?;
            if rank as usize >= slots.len() || rank == RANK_MANAGER {
                return Err(TransportError::Protocol {
                    what: format!("hello from out-of-range rank {rank}"),
                });
            }
            spawn_ctrl_reader(rank, stream.try_clone()?, tx.clone());
            slots[rank as usize] = Some(PeerSlot {
                stream,
                data_endpoint,
            });
        }
        let peers = slots
            .into_iter()
            .skip(1)
            .map(|slot| {
                slot.ok_or(TransportError::Protocol {
                    what: "a rank never said hello".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            peers,
            inbox: rx,
            inbox_tx: tx,
        })
    }

    /// Send a message to a rank.
    pub fn send(&mut self, to: u16, msg: CtrlMsg) -> Result<(), TransportError> {
        let slot = self
            .peers
            .get_mut(to as usize - 1)
            .ok_or(TransportError::Protocol {
                what: format!("send to unknown rank {to}"),
            })?;
        send_envelope(
            &mut slot.stream,
            &Envelope {
                from: RANK_MANAGER,
                to,
                msg,
            },
        )
    }

    /// Relay an envelope that is addressed to another node.
    pub fn relay(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let slot = self
            .peers
            .get_mut(envelope.to as usize - 1)
            .ok_or(TransportError::Protocol {
                what: format!("relay to unknown rank {}", envelope.to),
            })?;
        send_envelope(&mut slot.stream, &envelope)
    }

    /// Loop an envelope back into the manager's own inbox.
    pub fn send_to_self(&self, envelope: Envelope) {
        let _ = self.inbox_tx.send(envelope);
    }

    /// The data endpoint a rank advertised.
    pub fn data_endpoint(&self, rank: u16) -> Option<&Endpoint> {
        self.peers
            .get(rank as usize - 1)
            .and_then(|slot| slot.data_endpoint.as_ref())
    }

    /// The merged inbox of all peers.
    pub fn inbox(&self) -> &Receiver<Envelope> {
        &self.inbox
    }

    /// Number of connected peers (all ranks except the manager).
    pub fn n_peers(&self) -> usize {
        self.peers.len()
    }
}

/// An incoming data connection, identified by its stream hello.
pub struct DataConnection {
    /// Rank of the writer
    pub from_rank: u16,
    /// The reader-side stream index the writer targeted
    pub stream_nr: usize,
    /// The socket
    pub stream: TcpStream,
}

/// A data listener plus the accept thread feeding identified connections.
pub struct DataListener {
    port: u16,
    incoming: Receiver<DataConnection>,
}

impl DataListener {
    /// Bind an ephemeral port and start accepting.
    pub fn bind() -> Result<Self, TransportError> {
        let listener = TcpListener::bind("0.0.0.0:0")?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = bounded(64);
        thread::Builder::new()
            .name(format!("data-accept-{port}"))
            .spawn(move || loop {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let hello = (|| -> Result<(u16, u16), TransportError> {
                    let magic = stream.read_u32::<LittleEndian>()?;
                    if magic != DATA_HELLO_MAGIC {
                        return Err(TransportError::BadHello { got: magic });
                    }
                    Ok((
                        stream.read_u16::<LittleEndian>()?,
                        stream.read_u16::<LittleEndian>()?,
                    ))
                })();
                match hello {
                    Ok((from_rank, stream_nr)) => {
                        let _ = stream.set_nodelay(true);
                        if tx
                            .send(DataConnection {
                                from_rank,
                                stream_nr: stream_nr as usize,
                                stream,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => warn!("rejecting data connection: {e}"),
                }
            })
            .expect("spawn data accept thread");
        Ok(Self { port, incoming: rx })
    }

    /// The endpoint to advertise for this listener.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            addrs: local_addresses(),
            port: self.port,
        }
    }

    /// Identified incoming connections.
    pub fn incoming(&self) -> &Receiver<DataConnection> {
        &self.incoming
    }
}

/// The writer end of a data edge.
pub struct DataWriter {
    stream: TcpStream,
}

impl DataWriter {
    /// Dial a reader's endpoint and identify the stream.
    pub fn connect(
        endpoint: &Endpoint,
        my_rank: u16,
        reader_stream_nr: usize,
    ) -> Result<Self, TransportError> {
        let mut stream = connect_endpoint(endpoint, "data reader")?;
        stream.write_u32::<LittleEndian>(DATA_HELLO_MAGIC)?;
        stream.write_u16::<LittleEndian>(my_rank)?;
        stream.write_u16::<LittleEndian>(reader_stream_nr as u16)?;
        Ok(Self { stream })
    }

    /// Ship one slice: fixed header then the sample bytes.
    pub fn write_slice(&mut self, header: &SliceHeader, payload: &[u8]) -> Result<(), TransportError> {
        debug_assert_eq!(header.bytes as usize, payload.len());
        let s = &mut self.stream;
        s.write_u32::<LittleEndian>(SLICE_MAGIC)?;
        s.write_u32::<LittleEndian>(header.channel)?;
        s.write_i64::<LittleEndian>(header.start.ticks())?;
        s.write_u64::<LittleEndian>(header.samples_expected)?;
        s.write_u64::<LittleEndian>(header.samples_sent)?;
        s.write_i64::<LittleEndian>(header.applied_shift_samples)?;
        s.write_u64::<LittleEndian>(header.bytes)?;
        s.write_all(payload)?;
        Ok(())
    }

    /// Ship one opaque framed block (used for visibility records).
    pub fn write_block(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.stream, payload)
    }
}

/// The reader end of a data edge.
pub struct DataReader {
    stream: TcpStream,
}

impl DataReader {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Read one slice. `Ok(None)` when the writer closed the stream.
    pub fn read_slice(&mut self) -> Result<Option<(SliceHeader, Vec<u8>)>, TransportError> {
        let s = &mut self.stream;
        let magic = match s.read_u32::<LittleEndian>() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if magic != SLICE_MAGIC {
            return Err(TransportError::BadHello { got: magic });
        }
        let header = SliceHeader {
            channel: s.read_u32::<LittleEndian>()?,
            start: Time::from_ticks(s.read_i64::<LittleEndian>()?),
            samples_expected: s.read_u64::<LittleEndian>()?,
            samples_sent: s.read_u64::<LittleEndian>()?,
            applied_shift_samples: s.read_i64::<LittleEndian>()?,
            bytes: s.read_u64::<LittleEndian>()?,
        };
        let mut payload = vec![0u8; header.bytes as usize];
        s.read_exact(&mut payload)?;
        Ok(Some((header, payload)))
    }

    /// Read one opaque framed block. `Ok(None)` when the writer closed.
    pub fn read_block(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        read_frame(&mut self.stream)
    }
}

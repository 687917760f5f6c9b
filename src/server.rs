use crate::error::Result;
use crate::raft::{self, Envelope, Message, Node, NodeID, Request, RequestID, Response};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// A replikv server: a Raft node serving a line-oriented text protocol on a
/// single listening socket, shared by peers and clients.
///
/// All node and state machine mutations happen on the eventloop thread,
/// which owns them outright and consumes a queue of ticks, inbound RPCs, RPC
/// replies, and client submissions. Connection handling and outbound RPC I/O
/// run on short-lived threads that communicate with the eventloop through
/// channels, so no handler ever blocks on the network while the node is
/// being stepped.
pub struct Server {
    node: Node,
    node_rx: Receiver<Envelope>,
    /// The cluster addresses, one per node ID in order, including ourself.
    peers: Vec<String>,
}

/// Work for the eventloop.
enum Work {
    /// An inbound peer RPC. The node's response is sent back through
    /// reply_tx to the connection the request arrived on.
    Rpc { envelope: Envelope, reply_tx: Sender<String> },
    /// A response to an RPC we sent to a peer.
    Reply(Envelope),
    /// A client command submission. The formatted response text is sent
    /// through reply_tx when the command resolves.
    Submit { id: RequestID, request: Request, reply_tx: Sender<String> },
}

impl Server {
    /// Creates a server for the node `id` in the cluster given by `addrs`,
    /// one host:port address per node in ID order.
    pub fn new(id: NodeID, addrs: Vec<String>, state: Box<dyn raft::State>) -> Result<Self> {
        let (node_tx, node_rx) = unbounded();
        let peer_ids = (0..addrs.len() as NodeID).filter(|&p| p != id).collect();
        let node = Node::new(id, peer_ids, raft::Log::new(), state, node_tx)?;
        Ok(Self { node, node_rx, peers: addrs })
    }

    /// Accepts and serves connections on the given listener, running the
    /// Raft eventloop on the calling thread. Does not return during normal
    /// operation.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        let (work_tx, work_rx) = unbounded();
        let id = self.node.id();
        info!("Node {id} serving on {}", listener.local_addr()?);
        {
            let work_tx = work_tx.clone();
            std::thread::spawn(move || Self::accept(listener, id, work_tx));
        }
        self.eventloop(work_rx, work_tx)
    }

    /// Runs the Raft eventloop: ticks the node's logical clock, steps
    /// messages into it, and routes its outbound messages.
    fn eventloop(self, work_rx: Receiver<Work>, work_tx: Sender<Work>) -> Result<()> {
        let Server { mut node, node_rx, peers } = self;
        let ticker = crossbeam::channel::tick(raft::TICK_INTERVAL);
        // Pending client submissions, by request ID. A session that goes
        // away before its command resolves just orphans the reply; the
        // command still commits and applies.
        let mut sessions: HashMap<RequestID, Sender<String>> = HashMap::new();

        loop {
            // The reply channel of the RPC stepped in this iteration, if
            // any. The node answers every peer request while stepping it.
            let mut rpc_reply: Option<(NodeID, Sender<String>)> = None;

            crossbeam::select! {
                recv(ticker) -> msg => {
                    msg?;
                    node = node.tick()?;
                }
                recv(work_rx) -> work => match work? {
                    Work::Rpc { envelope, reply_tx } => {
                        rpc_reply = Some((envelope.from, reply_tx));
                        node = node.step(envelope)?;
                    }
                    Work::Reply(envelope) => node = node.step(envelope)?,
                    Work::Submit { id, request, reply_tx } => {
                        sessions.insert(id, reply_tx);
                        let message = Message::ClientRequest { id, request };
                        let envelope =
                            Envelope { from: node.id(), to: node.id(), term: node.term(), message };
                        node = node.step(envelope)?;
                    }
                }
            }

            for envelope in node_rx.try_iter() {
                match &envelope.message {
                    // Answer a waiting client session.
                    Message::ClientResponse { id, response } => {
                        if let Some(reply_tx) = sessions.remove(id) {
                            let _ = reply_tx.send(Self::format_response(&peers, response));
                        }
                    }
                    // Answer the peer RPC stepped in this iteration, on the
                    // connection it arrived on.
                    message if message.is_response() => match rpc_reply.take() {
                        Some((peer, reply_tx)) if peer == envelope.to => {
                            let _ = reply_tx.send(envelope.encode()?);
                        }
                        other => {
                            rpc_reply = other;
                            debug!("Dropping unroutable response {envelope:?}");
                        }
                    },
                    // Send a request to a peer over a fresh connection.
                    _ => Self::dispatch(&peers, envelope, &work_tx),
                }
            }
        }
    }

    /// Accepts connections, spawning a session thread per connection.
    fn accept(listener: TcpListener, id: NodeID, work_tx: Sender<Work>) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let work_tx = work_tx.clone();
                    std::thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|addr| addr.to_string())
                            .unwrap_or_else(|_| "unknown".to_string());
                        debug!("Connection from {peer}");
                        if let Err(err) = Self::session(stream, id, work_tx) {
                            debug!("Session with {peer} ended: {err}");
                        }
                    });
                }
                Err(err) => error!("Accept failed: {err}"),
            }
        }
    }

    /// Serves a single connection. Each line is classified by its first
    /// token: peer RPCs are answered once and the connection closed, while
    /// client commands keep the session alive for further commands.
    fn session(stream: TcpStream, id: NodeID, work_tx: Sender<Work>) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(()); // client closed the connection
            }
            // Strip the newline, tolerating CRLF clients. Empty command
            // lines are ignored.
            let input = line.trim_end_matches(['\r', '\n']);
            if input.is_empty() {
                continue;
            }

            match input.split_whitespace().next().unwrap_or_default() {
                "RequestVote" | "AppendEntries" => {
                    let envelope = Envelope::decode_request(input, id)?;
                    let (reply_tx, reply_rx) = bounded(1);
                    work_tx.send(Work::Rpc { envelope, reply_tx })?;
                    let response = reply_rx.recv()?;
                    writer.write_all(response.as_bytes())?;
                    writer.write_all(b"\n")?;
                    return Ok(()); // peer RPCs are one-shot
                }
                first => {
                    // GET and KEYS are read-only and served from local
                    // state; everything else goes through consensus.
                    let request = match first {
                        "GET" | "KEYS" => Request::Read(input.to_string()),
                        _ => Request::Write(input.to_string()),
                    };
                    let (reply_tx, reply_rx) = bounded(1);
                    work_tx.send(Work::Submit { id: Uuid::new_v4(), request, reply_tx })?;
                    let response = reply_rx.recv()?;
                    writer.write_all(response.as_bytes())?;
                }
            }
        }
    }

    /// Sends a request to a peer on a short-lived thread: one connection per
    /// RPC, write the request line, read one response line, and step the
    /// reply into the eventloop. Transport failures count as "no reply";
    /// the next heartbeat or election retries.
    fn dispatch(peers: &[String], envelope: Envelope, work_tx: &Sender<Work>) {
        let (from, to) = (envelope.from, envelope.to);
        let Some(addr) = peers.get(to as usize).cloned() else {
            error!("No address for peer {to}");
            return;
        };
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(err) => {
                error!("Can't encode outbound message: {err}");
                return;
            }
        };
        let work_tx = work_tx.clone();
        std::thread::spawn(move || match Self::rpc(&addr, &line) {
            Ok(response) => {
                match Envelope::decode_response(response.trim_end_matches(['\r', '\n']), to, from) {
                    Ok(envelope) => {
                        let _ = work_tx.send(Work::Reply(envelope));
                    }
                    Err(err) => debug!("Invalid RPC response from {addr}: {err}"),
                }
            }
            Err(err) => debug!("RPC to {addr} failed: {err}"),
        });
    }

    /// Performs a single request/response RPC exchange.
    fn rpc(addr: &str, line: &str) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        let mut response = String::new();
        if BufReader::new(stream).read_line(&mut response)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ));
        }
        Ok(response)
    }

    /// Formats a client response as protocol text. Not-leader redirects
    /// resolve the leader ID to its client-facing address when known.
    fn format_response(peers: &[String], response: &Response) -> String {
        match response {
            Response::State(text) => text.clone(),
            Response::NotLeader(Some(leader)) => match peers.get(*leader as usize) {
                Some(addr) => format!("NOT_LEADER {addr}\n"),
                None => "NOT_LEADER\n".to_string(),
            },
            Response::NotLeader(None) => "NOT_LEADER\n".to_string(),
        }
    }
}

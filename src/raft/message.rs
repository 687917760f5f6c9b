use super::{Entry, Index, NodeID, Term};
use crate::errdata;
use crate::error::Result;

/// A message between Raft nodes, with its envelope metadata. Peer messages
/// travel as single text lines; client requests and responses only exist
/// locally, between the node and the server eventloop.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// The sender.
    pub from: NodeID,
    /// The recipient.
    pub to: NodeID,
    /// The sender's current term.
    pub term: Term,
    /// The message payload.
    pub message: Message,
}

/// A message payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Candidates solicit votes from all peers when campaigning.
    RequestVote {
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// A node grants its vote to a candidate, at most once per term.
    VoteGranted,
    /// A node denies a candidate its vote.
    VoteDenied,

    /// Leaders replicate log entries to followers, and assert leadership by
    /// sending empty entry sets as heartbeats.
    AppendEntries {
        /// The index of the entry immediately preceding the sent entries.
        prev_index: Index,
        /// The term of the entry immediately preceding the sent entries.
        prev_term: Term,
        /// The leader's commit index.
        leader_commit: Index,
        /// The entries to replicate.
        entries: Vec<Entry>,
    },
    /// A follower accepted the leader's entries.
    Success,
    /// A follower rejected the leader's entries, either because of a stale
    /// term or because its log did not contain the prev_index/prev_term base
    /// entry. The leader responds by decrementing next_index and retrying.
    Fail,

    /// A client request, injected by the local server. Never sent to peers.
    ClientRequest { id: RequestID, request: Request },
    /// A client response, consumed by the local server. Never sent to peers.
    ClientResponse { id: RequestID, response: Response },
}

/// A client request ID, unique for the duration of the request.
pub type RequestID = uuid::Uuid;

/// A client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// A read-only command (GET, KEYS), served from local applied state.
    Read(String),
    /// A mutating command (SET, DEL), replicated through the log.
    Write(String),
}

/// A client response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// The state machine's response text.
    State(String),
    /// The node is not the leader. Carries the best-known leader, if any, so
    /// the server can format a redirect.
    NotLeader(Option<NodeID>),
}

impl Message {
    /// Returns true if this is a response to a peer RPC, i.e. a message that
    /// travels back on the connection the request arrived on.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::VoteGranted | Message::VoteDenied | Message::Success | Message::Fail
        )
    }
}

impl Envelope {
    /// Encodes a peer message as a wire line (without the trailing newline).
    ///
    /// Entry commands are hex-encoded: the fields of a line are
    /// space-separated, so raw commands containing spaces or newlines would
    /// corrupt the message framing.
    pub fn encode(&self) -> Result<String> {
        Ok(match &self.message {
            Message::RequestVote { last_index, last_term } => {
                format!("RequestVote {} {} {} {}", self.term, self.from, last_index, last_term)
            }
            Message::VoteGranted => format!("VoteGranted {}", self.term),
            Message::VoteDenied => format!("VoteDenied {}", self.term),
            Message::AppendEntries { prev_index, prev_term, leader_commit, entries } => {
                let mut line = format!(
                    "AppendEntries {} {} {} {} {}",
                    self.term, self.from, prev_index, prev_term, leader_commit
                );
                for entry in entries {
                    line.push_str(&format!(" {} {}", entry.term, hex::encode(&entry.command)));
                }
                line
            }
            Message::Success => format!("Success {}", self.term),
            Message::Fail => format!("Fail {}", self.term),
            Message::ClientRequest { .. } | Message::ClientResponse { .. } => {
                return errdata!("can't encode local message {:?}", self.message)
            }
        })
    }

    /// Decodes an inbound peer request line (RequestVote or AppendEntries)
    /// addressed to the given node. The sender is the embedded candidate or
    /// leader ID.
    pub fn decode_request(line: &str, to: NodeID) -> Result<Envelope> {
        let mut fields = Fields::new(line);
        match fields.next("message type")? {
            "RequestVote" => {
                let term = fields.parse("term")?;
                let from = fields.parse("candidate_id")?;
                let last_index = fields.parse("last_log_index")?;
                let last_term = fields.parse("last_log_term")?;
                fields.finish()?;
                Ok(Envelope { from, to, term, message: Message::RequestVote { last_index, last_term } })
            }
            "AppendEntries" => {
                let term = fields.parse("term")?;
                let from = fields.parse("leader_id")?;
                let prev_index = fields.parse("prev_log_index")?;
                let prev_term = fields.parse("prev_log_term")?;
                let leader_commit = fields.parse("leader_commit")?;
                let mut entries = Vec::new();
                while let Some(field) = fields.try_next() {
                    let term = field.parse().or_else(|_| errdata!("invalid entry term '{field}'"))?;
                    let command = String::from_utf8(hex::decode(fields.next("entry command")?)?)
                        .map_err(|e| crate::error::Error::InvalidData(e.to_string()))?;
                    entries.push(Entry { term, command });
                }
                Ok(Envelope {
                    from,
                    to,
                    term,
                    message: Message::AppendEntries { prev_index, prev_term, leader_commit, entries },
                })
            }
            kind => errdata!("unknown request '{kind}'"),
        }
    }

    /// Decodes an RPC response line. The sender is the peer the request was
    /// sent to, known from the RPC's connection.
    pub fn decode_response(line: &str, from: NodeID, to: NodeID) -> Result<Envelope> {
        let mut fields = Fields::new(line);
        let message = match fields.next("message type")? {
            "VoteGranted" => Message::VoteGranted,
            "VoteDenied" => Message::VoteDenied,
            "Success" => Message::Success,
            "Fail" => Message::Fail,
            kind => return errdata!("unknown response '{kind}'"),
        };
        let term = fields.parse("term")?;
        fields.finish()?;
        Ok(Envelope { from, to, term, message })
    }
}

/// A cursor over the space-separated fields of a wire line.
struct Fields<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str) -> Self {
        Self { inner: line.split_whitespace() }
    }

    /// Returns the next field, if any.
    fn try_next(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    /// Returns the next field, or an error naming the missing field.
    fn next(&mut self, name: &str) -> Result<&'a str> {
        match self.inner.next() {
            Some(field) => Ok(field),
            None => errdata!("missing {name}"),
        }
    }

    /// Parses the next field, or errors naming the field.
    fn parse<T: std::str::FromStr>(&mut self, name: &str) -> Result<T> {
        let field = self.next(name)?;
        field.parse().or_else(|_| errdata!("invalid {name} '{field}'"))
    }

    /// Errors if any fields remain.
    fn finish(&mut self) -> Result<()> {
        match self.inner.next() {
            Some(field) => errdata!("unexpected trailing field '{field}'"),
            None => Ok(()),
        }
    }
}

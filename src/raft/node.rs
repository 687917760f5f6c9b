use super::log::{Index, Log};
use super::message::{Envelope, Message, Request, RequestID, Response};
use super::state::State;
use super::{ELECTION_TIMEOUT_RANGE, HEARTBEAT_INTERVAL};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info};
use rand::Rng as _;
use std::collections::{HashMap, HashSet};

/// A node ID, the node's 0-based position in the cluster address list.
pub type NodeID = u8;

/// A leadership term. Monotonically non-decreasing on each node; at most one
/// leader can be elected per term.
pub type Term = u64;

/// A logical clock interval as a number of ticks.
pub type Ticks = u8;

/// A Raft node, with a dynamic role. The node is driven synchronously by
/// processing inbound messages via step() or by advancing time via tick().
/// These methods consume the current node, and return a new one with a
/// possibly different role. Outbound messages are sent via the given node_tx
/// channel.
///
/// This enum wraps the RawNode<Role> types, which implement the actual node
/// logic. It exists for ergonomic use across role transitions, i.e.
/// node = node.step()?.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Creates a new Raft node, starting as a leaderless follower, or leader
    /// if there are no peers.
    pub fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
    ) -> Result<Self> {
        let node = RawNode::<Follower>::new(id, peers, log, state, node_tx);
        if node.peers.is_empty() {
            // If there are no peers, become leader immediately.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// Returns the node ID.
    pub fn id(&self) -> NodeID {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// Returns the node's current term.
    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Processes a message from a peer or the local server.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        debug!("Stepping {msg:?}");
        match self {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Candidate(n) => n.tick(),
            Node::Follower(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// A Raft role: leader, follower, or candidate.
pub trait Role {}

/// A Raft node with the concrete role R.
///
/// This implements the typestate pattern, where individual node states
/// (roles) are encoded as RawNode<Role>.
pub struct RawNode<R: Role = Follower> {
    id: NodeID,
    peers: HashSet<NodeID>,
    /// The current term. Kept in memory only, like the vote: a restarted
    /// node rejoins at term 0 and catches up from the leader. This trades
    /// the standard restart-safety guarantee (a node could vote twice in a
    /// term across incarnations) for a journal-only persistence story.
    term: Term,
    /// The node we voted for in the current term, if any. Reset when the
    /// term advances.
    vote: Option<NodeID>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Helper for role transitions.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            vote: self.vote,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            role,
        }
    }

    /// Returns the cluster size as number of nodes.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the cluster quorum size (strict majority).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector, in descending
    /// order. The vector must have the same size as the cluster.
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "vector size must match cluster size");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message.
    fn send(&self, to: NodeID, message: Message) -> Result<()> {
        let msg = Envelope { from: self.id, to, term: self.term, message };
        debug!("Sending {msg:?}");
        Ok(self.node_tx.send(msg)?)
    }

    /// Broadcasts a message to all peers.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Sort for test determinism.
        for id in self.peers.iter().copied().sorted() {
            self.send(id, message.clone())?;
        }
        Ok(())
    }

    /// Generates a randomized election timeout. Drawn fresh on every rearm,
    /// so repeated elections don't stay synchronized across nodes.
    fn gen_election_timeout(&self) -> Ticks {
        rand::thread_rng().gen_range(ELECTION_TIMEOUT_RANGE)
    }

    /// Answers a request from a stale term with a denial carrying our
    /// current term, so the sender steps down. Stale responses are dropped.
    fn reply_stale(&self, msg: &Envelope) -> Result<()> {
        match msg.message {
            Message::RequestVote { .. } => self.send(msg.from, Message::VoteDenied),
            Message::AppendEntries { .. } => self.send(msg.from, Message::Fail),
            _ => {
                debug!("Dropping message from stale term ({msg:?})");
                Ok(())
            }
        }
    }

    /// Serves a read-only command from local applied state. Any role serves
    /// reads; followers may lag the leader (stale reads are allowed).
    fn read(&self, id: RequestID, command: &str) -> Result<()> {
        let response = Response::State(self.state.read(command));
        self.send(self.id, Message::ClientResponse { id, response })
    }

    /// Asserts message invariants when stepping.
    fn assert_step(&self, msg: &Envelope) {
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(msg.from == self.id || self.peers.contains(&msg.from), "unknown sender {}", msg.from);
    }
}

/// A candidate is campaigning to become a leader.
pub struct Candidate {
    /// Votes received (including ourself).
    votes: HashSet<NodeID>,
    /// Ticks elapsed since election start.
    election_duration: Ticks,
    /// Election timeout, in ticks.
    election_timeout: Ticks,
}

impl Candidate {
    /// Creates a new candidate role.
    fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Transitions the candidate to a follower. We either lost the election
    /// and follow the winner, or we discovered a new term in which case we
    /// step into it as a leaderless follower.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        let election_timeout = self.gen_election_timeout();
        if let Some(leader) = leader {
            // We lost the election, follow the winner.
            assert_eq!(term, self.term, "can't follow leader in different term");
            info!("Lost election, following leader {leader} in term {term}");
            Ok(self.into_role(Follower::new(Some(leader), election_timeout)))
        } else {
            // We found a new term, but don't yet know who the leader is.
            // We'll find out when we step a message from it.
            assert_ne!(term, self.term, "can't be leaderless follower in current term");
            info!("Discovered new term {term}");
            self.term = term;
            self.vote = None;
            Ok(self.into_role(Follower::new(None, election_timeout)))
        }
    }

    /// Transitions the candidate to a leader. We won the election.
    fn into_leader(self) -> Result<RawNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let role = Leader::new(&self.peers, self.log.len());
        let mut node = self.into_role(role);

        // Assert leadership by sending an AppendEntries to everyone. No
        // entry is proposed on election; entries from prior terms are only
        // committed transitively, once a client write from this term
        // commits.
        node.broadcast_append_entries()?;
        node.maybe_commit_and_apply()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // If we receive a message for a future term, become a leaderless
        // follower in it and step the message. If the message is an
        // AppendEntries from the new leader, stepping it will follow it.
        if msg.term > self.term {
            return self.into_follower(None, msg.term)?.step(msg);
        }
        // Deny requests from past terms, so the stale sender steps down.
        if msg.term < self.term {
            self.reply_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            // Don't grant votes to other candidates who also campaign; we
            // have already voted for ourself.
            Message::RequestVote { .. } => self.send(msg.from, Message::VoteDenied)?,

            // If a vote gives us quorum, assume leadership.
            Message::VoteGranted => {
                self.role.votes.insert(msg.from);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            // We didn't get a vote. :(
            Message::VoteDenied => {}

            // If we receive entries in this term, we lost the election and
            // have a new leader. Follow it and step the message.
            Message::AppendEntries { .. } => {
                return self.into_follower(Some(msg.from), msg.term)?.step(msg);
            }

            // Reads are served from local state regardless of role.
            Message::ClientRequest { id, request: Request::Read(command) } => {
                self.read(id, &command)?;
            }

            // We can't accept writes mid-election, and don't know a leader
            // to redirect to.
            Message::ClientRequest { id, request: Request::Write(_) } => {
                self.send(msg.from, Message::ClientResponse { id, response: Response::NotLeader(None) })?;
            }

            // Replication replies can trail in after we lost leadership in
            // an earlier term and campaigned again. Ignore them.
            Message::Success | Message::Fail => {}

            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.election_duration += 1;
        if self.role.election_duration >= self.role.election_timeout {
            // The election timed out without a winner; start a new one.
            self.campaign()?;
        }
        Ok(self.into())
    }

    /// Campaigns for leadership by increasing the term, voting for ourself,
    /// and soliciting votes from all peers.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!("Starting new election for term {term}");
        self.role = Candidate::new(self.gen_election_timeout());
        self.role.votes.insert(self.id); // vote for ourself
        self.term = term;
        self.vote = Some(self.id);

        let (last_index, last_term) = (self.log.last_index(), self.log.last_term());
        self.broadcast(Message::RequestVote { last_index, last_term })
    }
}

// A follower replicates state from a leader.
pub struct Follower {
    /// The leader, or None if just initialized.
    leader: Option<NodeID>,
    /// The number of ticks since the last message from the leader.
    leader_seen: Ticks,
    /// The leader_seen timeout before triggering an election.
    election_timeout: Ticks,
}

impl Follower {
    /// Creates a new follower role.
    fn new(leader: Option<NodeID>, election_timeout: Ticks) -> Self {
        Self { leader, leader_seen: 0, election_timeout }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Creates a new node as a leaderless follower.
    fn new(
        id: NodeID,
        peers: HashSet<NodeID>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
    ) -> Self {
        let role = Follower::new(None, 0);
        let mut node = Self { id, peers, term: 0, vote: None, log, state, node_tx, role };
        node.role.election_timeout = node.gen_election_timeout();
        node
    }

    /// Transitions the follower into a follower in a new term, or one that
    /// just discovered its leader.
    fn into_follower(mut self, leader: Option<NodeID>, term: Term) -> RawNode<Follower> {
        assert!(term >= self.term, "term regression {} → {}", self.term, term);

        if term > self.term {
            info!("Discovered new term {term}");
            self.term = term;
            self.vote = None;
        }
        self.role = Follower::new(leader, self.gen_election_timeout());
        self
    }

    /// Transitions the follower into a candidate, by campaigning for
    /// leadership in a new term.
    fn into_candidate(self) -> Result<RawNode<Candidate>> {
        let election_timeout = self.gen_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // If we receive a message for a future term, step into it first.
        if msg.term > self.term {
            return self.into_follower(None, msg.term).step(msg);
        }
        // Deny requests from past terms, so the stale sender steps down.
        if msg.term < self.term {
            self.reply_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            // A candidate is requesting our vote. Grant it if its log is at
            // least as up-to-date as ours and we haven't voted for anyone
            // else in this term (see section 5.4.1 in the Raft paper).
            Message::RequestVote { last_index, last_term } => {
                let log_ok = last_term > self.log.last_term()
                    || (last_term == self.log.last_term() && last_index >= self.log.last_index());
                if log_ok && self.vote.map_or(true, |v| v == msg.from) {
                    info!("Voting for {} in term {} election", msg.from, self.term);
                    self.vote = Some(msg.from);
                    // Granting a vote rearms the election timer, giving the
                    // candidate a chance to win before we campaign.
                    self.role.leader_seen = 0;
                    self.role.election_timeout = self.gen_election_timeout();
                    self.send(msg.from, Message::VoteGranted)?;
                } else {
                    self.send(msg.from, Message::VoteDenied)?;
                }
            }

            // The leader is replicating entries (or heartbeating with an
            // empty entry set). Append them if our log contains the base
            // entry, otherwise ask the leader to back off.
            Message::AppendEntries { prev_index, prev_term, leader_commit, entries } => {
                match self.role.leader {
                    Some(leader) => assert_eq!(leader, msg.from, "multiple leaders in term"),
                    None => {
                        info!("Following leader {} in term {}", msg.from, self.term);
                        self.role.leader = Some(msg.from);
                    }
                }
                self.role.leader_seen = 0;
                self.role.election_timeout = self.gen_election_timeout();

                if !self.log.has(prev_index, prev_term) {
                    debug!("Rejecting entries: no log entry {prev_index} with term {prev_term}");
                    self.send(msg.from, Message::Fail)?;
                } else {
                    self.log.splice(prev_index, entries);
                    if leader_commit > self.log.commit_index() {
                        let commit = std::cmp::min(leader_commit, self.log.last_index());
                        self.log.commit(commit);
                        self.maybe_apply()?;
                    }
                    self.send(msg.from, Message::Success)?;
                }
            }

            // Votes may arrive after we lost an election and followed a
            // different leader. Ignore them.
            Message::VoteGranted | Message::VoteDenied => {}

            // Replication replies may trail in after we stepped down from
            // leadership in a previous term. Ignore them.
            Message::Success | Message::Fail => {}

            // Reads are served from local applied state, which may lag the
            // leader (stale reads are allowed).
            Message::ClientRequest { id, request: Request::Read(command) } => {
                self.read(id, &command)?;
            }

            // Writes must go to the leader; redirect the client to the
            // best-known one.
            Message::ClientRequest { id, request: Request::Write(_) } => {
                let response = Response::NotLeader(self.role.leader);
                self.send(msg.from, Message::ClientResponse { id, response })?;
            }

            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.leader_seen += 1;
        if self.role.leader_seen >= self.role.election_timeout {
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Applies any pending committed entries. Followers have no clients
    /// waiting, so responses are discarded.
    fn maybe_apply(&mut self) -> Result<()> {
        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let command = self.log.get(index).expect("missing committed entry").command.clone();
            debug!("Applying entry {index}");
            self.state.apply(index, &command)?;
        }
        Ok(())
    }
}

/// Follower replication progress, as tracked by the leader.
struct Progress {
    /// The next log index to send to the follower.
    next_index: Index,
    /// The highest log index known to be replicated on the follower.
    match_index: Index,
}

/// A pending client write, answered when its entry is applied.
struct Write {
    /// The write request ID.
    id: RequestID,
}

// A leader serves requests and replicates the log to followers.
pub struct Leader {
    /// Follower replication progress.
    progress: HashMap<NodeID, Progress>,
    /// Pending client writes, keyed by the log index of their entry. Added
    /// when the write is appended to the leader's log, and removed when the
    /// entry is applied and the result is returned to the client. If the
    /// leader steps down, all pending writes are answered with a not-leader
    /// failure so no client hangs.
    writes: HashMap<Index, Write>,
    /// Number of ticks since the last periodic heartbeat.
    since_heartbeat: Ticks,
}

impl Leader {
    /// Creates a new leader role. next_index is initialized to the length of
    /// the leader's log, match_index to 0.
    fn new(peers: &HashSet<NodeID>, next_index: Index) -> Self {
        let progress = peers
            .iter()
            .map(|&p| (p, Progress { next_index, match_index: 0 }))
            .collect();
        Self { progress, writes: HashMap::new(), since_heartbeat: 0 }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Transitions the leader into a follower. This can only happen if we
    /// discover a new term, so we become a leaderless follower.
    fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term, "can only step down to a later term");
        info!("Discovered new term {term}, stepping down");

        // Answer pending writes so no client session hangs waiting for an
        // entry this node can no longer commit.
        let writes = std::mem::take(&mut self.role.writes);
        for (_, write) in writes.into_iter().sorted_by_key(|(index, _)| *index) {
            let response = Response::NotLeader(None);
            self.send(self.id, Message::ClientResponse { id: write.id, response })?;
        }

        self.term = term;
        self.vote = None;
        let election_timeout = self.gen_election_timeout();
        Ok(self.into_role(Follower::new(None, election_timeout)))
    }

    /// Processes a message.
    fn step(mut self, msg: Envelope) -> Result<Node> {
        self.assert_step(&msg);

        // If we receive a message for a future term, step down and into it.
        if msg.term > self.term {
            return self.into_follower(msg.term)?.step(msg);
        }
        // Deny requests from past terms, so the stale sender steps down.
        if msg.term < self.term {
            self.reply_stale(&msg)?;
            return Ok(self.into());
        }

        match msg.message {
            // There can't be two leaders in the same term.
            Message::AppendEntries { .. } => {
                panic!("saw other leader {} in term {}", msg.from, msg.term)
            }

            // Don't grant other votes in this term; we were elected in it.
            Message::RequestVote { .. } => self.send(msg.from, Message::VoteDenied)?,

            // Votes can come in after we won the election. Ignore them.
            Message::VoteGranted | Message::VoteDenied => {}

            // A follower accepted our entries. Its log now matches ours as
            // of the send, so advance it to our tail and try to commit. The
            // update is idempotent, so reordered replies are harmless.
            Message::Success => {
                let (next_index, match_index) = (self.log.len(), self.log.last_index());
                let progress = self.role.progress.get_mut(&msg.from).expect("unknown node");
                progress.next_index = next_index;
                progress.match_index = match_index;
                self.maybe_commit_and_apply()?;
            }

            // A follower rejected our entries: its log doesn't contain the
            // base entry we sent. Back off one index and retry. The wire
            // carries no conflict hint, so probing is linear.
            Message::Fail => {
                let progress = self.role.progress.get_mut(&msg.from).expect("unknown node");
                progress.next_index = std::cmp::max(1, progress.next_index - 1);
                self.send_append_entries(msg.from)?;
            }

            // Reads are served from local applied state. The leader's state
            // reflects every write it has acknowledged.
            Message::ClientRequest { id, request: Request::Read(command) } => {
                self.read(id, &command)?;
            }

            // A client write. Append it to our log and replicate it; the
            // response is sent once the entry is committed and applied.
            Message::ClientRequest { id, request: Request::Write(command) } => {
                let index = self.log.append(self.term, command);
                self.role.writes.insert(index, Write { id });
                debug!("Appended write at index {index}, replicating");
                self.broadcast_append_entries()?;
                if self.peers.is_empty() {
                    self.maybe_commit_and_apply()?;
                }
            }

            Message::ClientResponse { .. } => panic!("unexpected message {msg:?}"),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick.
    fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat += 1;
        if self.role.since_heartbeat >= HEARTBEAT_INTERVAL {
            self.broadcast_append_entries()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    /// Sends an AppendEntries to every peer. Peers that are caught up get an
    /// empty entry set, which doubles as the heartbeat.
    fn broadcast_append_entries(&self) -> Result<()> {
        // Sort for test determinism.
        for peer in self.peers.iter().copied().sorted() {
            self.send_append_entries(peer)?;
        }
        Ok(())
    }

    /// Sends the log entries from next_index onwards to the given peer.
    fn send_append_entries(&self, peer: NodeID) -> Result<()> {
        let progress = self.role.progress.get(&peer).expect("unknown node");
        let prev_index = progress.next_index - 1;
        let prev_term = self.log.get(prev_index).expect("missing base entry").term;
        let entries = self.log.entries_from(progress.next_index);
        debug!("Replicating {} entries at base {prev_index} to {peer}", entries.len());
        self.send(
            peer,
            Message::AppendEntries {
                prev_index,
                prev_term,
                leader_commit: self.log.commit_index(),
                entries,
            },
        )
    }

    /// Commits any new entries that have been replicated to a quorum, and
    /// applies them to the state machine, answering the waiting client
    /// writes in log-index order.
    fn maybe_commit_and_apply(&mut self) -> Result<Index> {
        // The quorum index is the highest index replicated on a majority.
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );
        if quorum_index <= self.log.commit_index() {
            return Ok(self.log.commit_index());
        }

        // Only entries from our own term can be committed by counting
        // replicas (see section 5.4.2 in the Raft paper); earlier entries
        // commit transitively.
        if self.log.get(quorum_index).expect("missing quorum entry").term != self.term {
            return Ok(self.log.commit_index());
        }
        self.log.commit(quorum_index);

        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let command = self.log.get(index).expect("missing committed entry").command.clone();
            debug!("Applying entry {index}");
            let result = self.state.apply(index, &command)?;
            if let Some(write) = self.role.writes.remove(&index) {
                let response = Response::State(result);
                self.send(self.id, Message::ClientResponse { id: write.id, response })?;
            }
        }
        Ok(self.log.commit_index())
    }
}

#[cfg(test)]
mod tests {
    use super::super::log::Entry;
    use super::super::state::test::Echo;
    use super::*;
    use crossbeam::channel::Receiver;
    use std::sync::{Arc, Mutex};

    /// Creates a follower node 1 with the given peers and log, returning the
    /// node, its outbound message channel, and the applied command record.
    fn setup(
        peers: &[NodeID],
        log: Log,
    ) -> (RawNode<Follower>, Receiver<Envelope>, Arc<Mutex<Vec<String>>>) {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (state, applied) = Echo::new();
        let node =
            RawNode::<Follower>::new(1, peers.iter().copied().collect(), log, Box::new(state), node_tx);
        (node, node_rx, applied)
    }

    /// Builds a log from (term, command) pairs.
    fn build_log(entries: &[(Term, &str)]) -> Log {
        let mut log = Log::new();
        log.splice(0, entries.iter().map(|(term, c)| Entry { term: *term, command: c.to_string() }).collect());
        log
    }

    fn envelope(from: NodeID, to: NodeID, term: Term, message: Message) -> Envelope {
        Envelope { from, to, term, message }
    }

    /// Drains and returns all sent messages.
    fn sent(node_rx: &Receiver<Envelope>) -> Vec<Envelope> {
        node_rx.try_iter().collect()
    }

    /// Ticks a follower or candidate until it campaigns as a candidate,
    /// returning it. Panics if no election starts within the maximum
    /// election timeout.
    fn tick_until_candidate(mut node: Node) -> Node {
        for _ in 0..ELECTION_TIMEOUT_RANGE.end {
            node = node.tick().unwrap();
            if let Node::Candidate(_) = node {
                return node;
            }
        }
        panic!("node never campaigned")
    }

    /// Elects node 1 as leader of a 3-node cluster in term 1.
    fn setup_leader() -> (RawNode<Leader>, Receiver<Envelope>, Arc<Mutex<Vec<String>>>) {
        let (node, node_rx, applied) = setup(&[2, 3], Log::new());
        let node = tick_until_candidate(node.into());
        let node = node.step(envelope(2, 1, 1, Message::VoteGranted)).unwrap();
        let Node::Leader(leader) = node else { panic!("expected leader") };
        sent(&node_rx); // discard election traffic
        (leader, node_rx, applied)
    }

    #[test]
    fn follower_grants_vote_once_per_term() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());

        // Candidate 2 campaigns in term 1; its empty log matches ours.
        let node = Node::from(node)
            .step(envelope(2, 1, 1, Message::RequestVote { last_index: 0, last_term: 0 }))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 1, Message::VoteGranted)]);
        assert_eq!(node.term(), 1);

        // A competing candidate in the same term is denied.
        let node = node
            .step(envelope(3, 1, 1, Message::RequestVote { last_index: 0, last_term: 0 }))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 3, 1, Message::VoteDenied)]);

        // The original candidate is granted the same vote again.
        node.step(envelope(2, 1, 1, Message::RequestVote { last_index: 0, last_term: 0 })).unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 1, Message::VoteGranted)]);
    }

    #[test]
    fn follower_denies_vote_for_stale_term() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = Node::from(node)
            .step(envelope(2, 1, 2, Message::RequestVote { last_index: 0, last_term: 0 }))
            .unwrap();
        sent(&node_rx);

        // A candidate from a past term is denied, with our current term.
        node.step(envelope(3, 1, 1, Message::RequestVote { last_index: 0, last_term: 0 })).unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 3, 2, Message::VoteDenied)]);
    }

    #[test]
    fn follower_denies_vote_for_outdated_log() {
        let (node, node_rx, _) = setup(&[2, 3], build_log(&[(1, "a"), (2, "b")]));

        // The candidate's log ends in an older term.
        let node = Node::from(node)
            .step(envelope(2, 1, 3, Message::RequestVote { last_index: 5, last_term: 1 }))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 3, Message::VoteDenied)]);

        // Same last term but a shorter log is also denied.
        let node = node
            .step(envelope(2, 1, 3, Message::RequestVote { last_index: 1, last_term: 2 }))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 3, Message::VoteDenied)]);

        // An equally long log is up-to-date and gets the vote.
        node.step(envelope(2, 1, 3, Message::RequestVote { last_index: 2, last_term: 2 })).unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 3, Message::VoteGranted)]);
    }

    #[test]
    fn follower_accepts_entries_and_applies_committed() {
        let (node, node_rx, applied) = setup(&[2, 3], Log::new());

        // Leader 2 replicates two entries, the first already committed.
        let node = Node::from(node)
            .step(envelope(
                2,
                1,
                1,
                Message::AppendEntries {
                    prev_index: 0,
                    prev_term: 0,
                    leader_commit: 1,
                    entries: vec![
                        Entry { term: 1, command: "SET a 1".to_string() },
                        Entry { term: 1, command: "SET b 2".to_string() },
                    ],
                },
            ))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 1, Message::Success)]);
        assert_eq!(*applied.lock().unwrap(), vec!["SET a 1".to_string()]);

        // A heartbeat advancing the commit index applies the second entry.
        node.step(envelope(
            2,
            1,
            1,
            Message::AppendEntries { prev_index: 2, prev_term: 1, leader_commit: 2, entries: vec![] },
        ))
        .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 1, Message::Success)]);
        assert_eq!(*applied.lock().unwrap(), vec!["SET a 1".to_string(), "SET b 2".to_string()]);
    }

    #[test]
    fn follower_rejects_entries_with_missing_base() {
        let (node, node_rx, _) = setup(&[2, 3], build_log(&[(1, "a")]));

        // The base entry is past our log end.
        let node = Node::from(node)
            .step(envelope(
                2,
                1,
                2,
                Message::AppendEntries {
                    prev_index: 3,
                    prev_term: 1,
                    leader_commit: 0,
                    entries: vec![Entry { term: 2, command: "x".to_string() }],
                },
            ))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 2, Message::Fail)]);

        // The base entry exists but with a different term.
        node.step(envelope(
            2,
            1,
            2,
            Message::AppendEntries {
                prev_index: 1,
                prev_term: 2,
                leader_commit: 0,
                entries: vec![Entry { term: 2, command: "x".to_string() }],
            },
        ))
        .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 2, Message::Fail)]);
    }

    #[test]
    fn follower_truncates_conflicting_tail() {
        let (node, node_rx, _) = setup(&[2, 3], build_log(&[(1, "a"), (1, "b")]));

        // A new leader in term 2 replaces our uncommitted entry at index 2.
        let node = Node::from(node)
            .step(envelope(
                2,
                1,
                2,
                Message::AppendEntries {
                    prev_index: 1,
                    prev_term: 1,
                    leader_commit: 0,
                    entries: vec![Entry { term: 2, command: "c".to_string() }],
                },
            ))
            .unwrap();
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 2, Message::Success)]);
        let Node::Follower(follower) = node else { panic!("expected follower") };
        assert_eq!(follower.log.last_index(), 2);
        assert_eq!(follower.log.get(2).unwrap().command, "c");
    }

    #[test]
    fn follower_campaigns_on_election_timeout() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = tick_until_candidate(node.into());
        assert_eq!(node.term(), 1);
        assert_eq!(
            sent(&node_rx),
            vec![
                envelope(1, 2, 1, Message::RequestVote { last_index: 0, last_term: 0 }),
                envelope(1, 3, 1, Message::RequestVote { last_index: 0, last_term: 0 }),
            ]
        );
    }

    #[test]
    fn candidate_becomes_leader_on_quorum() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = tick_until_candidate(node.into());
        sent(&node_rx);

        // One vote plus our own is a quorum of 3. The new leader asserts
        // leadership with an empty AppendEntries to everyone.
        let node = node.step(envelope(2, 1, 1, Message::VoteGranted)).unwrap();
        assert!(matches!(node, Node::Leader(_)));
        assert_eq!(
            sent(&node_rx),
            vec![
                envelope(
                    1,
                    2,
                    1,
                    Message::AppendEntries { prev_index: 0, prev_term: 0, leader_commit: 0, entries: vec![] }
                ),
                envelope(
                    1,
                    3,
                    1,
                    Message::AppendEntries { prev_index: 0, prev_term: 0, leader_commit: 0, entries: vec![] }
                ),
            ]
        );
    }

    #[test]
    fn candidate_restarts_election_on_timeout() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = tick_until_candidate(node.into());
        sent(&node_rx);

        let node = tick_until_candidate(node);
        assert_eq!(node.term(), 2);
        assert_eq!(
            sent(&node_rx),
            vec![
                envelope(1, 2, 2, Message::RequestVote { last_index: 0, last_term: 0 }),
                envelope(1, 3, 2, Message::RequestVote { last_index: 0, last_term: 0 }),
            ]
        );
    }

    #[test]
    fn candidate_follows_leader_of_same_term() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = tick_until_candidate(node.into());
        sent(&node_rx);

        // An AppendEntries in our term means we lost the election.
        let node = node
            .step(envelope(
                2,
                1,
                1,
                Message::AppendEntries { prev_index: 0, prev_term: 0, leader_commit: 0, entries: vec![] },
            ))
            .unwrap();
        let Node::Follower(follower) = node else { panic!("expected follower") };
        assert_eq!(follower.role.leader, Some(2));
        assert_eq!(sent(&node_rx), vec![envelope(1, 2, 1, Message::Success)]);
    }

    #[test]
    fn leader_replicates_commits_and_answers_write() {
        let (leader, node_rx, applied) = setup_leader();
        let id = uuid::Uuid::new_v4();

        // A client write is appended and eagerly replicated.
        let request = Request::Write("SET a 1".to_string());
        let node = Node::from(leader)
            .step(envelope(1, 1, 1, Message::ClientRequest { id, request }))
            .unwrap();
        let entries = vec![Entry { term: 1, command: "SET a 1".to_string() }];
        assert_eq!(
            sent(&node_rx),
            vec![
                envelope(
                    1,
                    2,
                    1,
                    Message::AppendEntries {
                        prev_index: 0,
                        prev_term: 0,
                        leader_commit: 0,
                        entries: entries.clone()
                    }
                ),
                envelope(
                    1,
                    3,
                    1,
                    Message::AppendEntries { prev_index: 0, prev_term: 0, leader_commit: 0, entries }
                ),
            ]
        );

        // One follower acceptance forms a quorum: the entry commits, is
        // applied, and the client write is answered.
        node.step(envelope(2, 1, 1, Message::Success)).unwrap();
        assert_eq!(*applied.lock().unwrap(), vec!["SET a 1".to_string()]);
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                1,
                1,
                1,
                Message::ClientResponse { id, response: Response::State("applied SET a 1\n".to_string()) }
            )]
        );
    }

    #[test]
    fn leader_backs_off_on_fail() {
        let (mut leader, node_rx, _) = setup_leader();
        leader.log.append(1, "a".to_string());
        leader.log.append(1, "b".to_string());
        leader.role.progress.get_mut(&2).unwrap().next_index = 3;

        // A rejection probes one index earlier, resending the suffix.
        Node::from(leader).step(envelope(2, 1, 1, Message::Fail)).unwrap();
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                1,
                2,
                1,
                Message::AppendEntries {
                    prev_index: 1,
                    prev_term: 1,
                    leader_commit: 0,
                    entries: vec![Entry { term: 1, command: "b".to_string() }],
                }
            )]
        );
    }

    #[test]
    fn leader_only_commits_entries_from_own_term() {
        let (leader, node_rx, applied) = setup_leader();

        // Append a term 1 write that never reaches quorum, then lose
        // leadership to a term 2 election and win it back in term 3, leaving
        // an uncommitted entry from an earlier term in our log.
        let id = uuid::Uuid::new_v4();
        let request = Request::Write("old".to_string());
        let node = Node::from(leader)
            .step(envelope(1, 1, 1, Message::ClientRequest { id, request }))
            .unwrap();
        let node = node
            .step(envelope(3, 1, 2, Message::RequestVote { last_index: 0, last_term: 0 }))
            .unwrap();
        let node = tick_until_candidate(node);
        assert_eq!(node.term(), 3);
        let node = node.step(envelope(2, 1, 3, Message::VoteGranted)).unwrap();
        sent(&node_rx);

        // A quorum matches the old entry, but it is from term 1 and can't be
        // committed by counting replicas in term 3.
        let node = node.step(envelope(2, 1, 3, Message::Success)).unwrap();
        assert!(applied.lock().unwrap().is_empty());
        sent(&node_rx);

        // A write in our own term commits, and the old entry commits
        // transitively.
        let id = uuid::Uuid::new_v4();
        let request = Request::Write("new".to_string());
        let node = node.step(envelope(1, 1, 3, Message::ClientRequest { id, request })).unwrap();
        sent(&node_rx);
        node.step(envelope(2, 1, 3, Message::Success)).unwrap();
        assert_eq!(*applied.lock().unwrap(), vec!["old".to_string(), "new".to_string()]);
    }

    #[test]
    fn leader_steps_down_and_answers_pending_writes() {
        let (leader, node_rx, _) = setup_leader();
        let id = uuid::Uuid::new_v4();

        // Append a write that never reaches quorum.
        let request = Request::Write("SET a 1".to_string());
        let node = Node::from(leader)
            .step(envelope(1, 1, 1, Message::ClientRequest { id, request }))
            .unwrap();
        sent(&node_rx);

        // A candidate campaigns in a later term. We step down and must
        // answer the pending write so the client doesn't hang.
        let node = node
            .step(envelope(3, 1, 2, Message::RequestVote { last_index: 0, last_term: 0 }))
            .unwrap();
        assert!(matches!(node, Node::Follower(_)));
        let messages = sent(&node_rx);
        assert_eq!(
            messages[0],
            envelope(1, 1, 1, Message::ClientResponse { id, response: Response::NotLeader(None) })
        );
        // The vote itself is denied: our log has an entry the candidate lacks.
        assert_eq!(messages[1], envelope(1, 3, 2, Message::VoteDenied));
    }

    #[test]
    fn follower_redirects_writes_to_known_leader() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let node = Node::from(node)
            .step(envelope(
                2,
                1,
                1,
                Message::AppendEntries { prev_index: 0, prev_term: 0, leader_commit: 0, entries: vec![] },
            ))
            .unwrap();
        sent(&node_rx);

        let id = uuid::Uuid::new_v4();
        let request = Request::Write("SET a 1".to_string());
        node.step(envelope(1, 1, 1, Message::ClientRequest { id, request })).unwrap();
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                1,
                1,
                1,
                Message::ClientResponse { id, response: Response::NotLeader(Some(2)) }
            )]
        );
    }

    #[test]
    fn reads_are_served_locally_in_any_role() {
        let (node, node_rx, _) = setup(&[2, 3], Log::new());
        let id = uuid::Uuid::new_v4();
        let request = Request::Read("GET a".to_string());
        let node = Node::from(node)
            .step(envelope(1, 1, 0, Message::ClientRequest { id, request: request.clone() }))
            .unwrap();
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                1,
                1,
                0,
                Message::ClientResponse { id, response: Response::State("echo GET a\n".to_string()) }
            )]
        );

        let node = tick_until_candidate(node);
        sent(&node_rx);
        node.step(envelope(1, 1, 1, Message::ClientRequest { id, request })).unwrap();
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                1,
                1,
                1,
                Message::ClientResponse { id, response: Response::State("echo GET a\n".to_string()) }
            )]
        );
    }

    #[test]
    fn single_node_cluster_commits_immediately() {
        let (node_tx, node_rx) = crossbeam::channel::unbounded();
        let (state, applied) = Echo::new();
        let node = Node::new(0, HashSet::new(), Log::new(), Box::new(state), node_tx).unwrap();
        assert!(matches!(node, Node::Leader(_)));

        let id = uuid::Uuid::new_v4();
        let request = Request::Write("SET a 1".to_string());
        let term = node.term();
        node.step(envelope(0, 0, term, Message::ClientRequest { id, request })).unwrap();
        assert_eq!(*applied.lock().unwrap(), vec!["SET a 1".to_string()]);
        assert_eq!(
            sent(&node_rx),
            vec![envelope(
                0,
                0,
                term,
                Message::ClientResponse { id, response: Response::State("applied SET a 1\n".to_string()) }
            )]
        );
    }
}

mod log;
mod message;
mod node;
mod state;

pub use self::log::{Entry, Index, Log};
pub use message::{Envelope, Message, Request, RequestID, Response};
pub use node::{Node, NodeID, Term, Ticks};
pub use state::State;

/// The interval between logical clock ticks, as driven by the server
/// eventloop. All Raft timeouts are measured in ticks.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// The interval between leader heartbeats, in ticks (150 ms).
pub const HEARTBEAT_INTERVAL: Ticks = 3;

/// The range of randomized election timeouts, in ticks (300-500 ms). A fresh
/// timeout is drawn whenever the timer is rearmed. The ratio to the heartbeat
/// interval satisfies the usual stability rule.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 6..11;

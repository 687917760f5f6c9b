use super::Index;
use crate::error::Result;

/// A Raft-managed state machine. Committed log entries are applied in index
/// order, identically on every node; responses are only returned to clients
/// on the node that proposed the command.
pub trait State: Send {
    /// Returns the index of the last applied entry. 0 if nothing has been
    /// applied. The Raft node only ever applies the entry at applied_index
    /// + 1, so implementations just record the index they're given.
    fn applied_index(&self) -> Index;

    /// Applies the committed command at the given index and returns its
    /// response text. Command-level failures (e.g. parse errors) must be
    /// deterministic and are reported in the response text; an Err return is
    /// reserved for environmental failures such as I/O errors, which halt
    /// the node rather than risk replica divergence.
    fn apply(&mut self, index: Index, command: &str) -> Result<String>;

    /// Executes a read-only command against current applied state.
    fn read(&self, command: &str) -> String;
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A state machine which records applied commands, for node tests. The
    /// apply response echoes the command, and reads echo the command with an
    /// "echo " prefix.
    pub struct Echo {
        applied_index: Index,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl Echo {
        pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            let commands = Arc::new(Mutex::new(Vec::new()));
            (Self { applied_index: 0, commands: commands.clone() }, commands)
        }
    }

    impl State for Echo {
        fn applied_index(&self) -> Index {
            self.applied_index
        }

        fn apply(&mut self, index: Index, command: &str) -> Result<String> {
            assert_eq!(index, self.applied_index + 1, "apply out of order");
            self.applied_index = index;
            self.commands.lock().unwrap().push(command.to_string());
            Ok(format!("applied {command}\n"))
        }

        fn read(&self, command: &str) -> String {
            format!("echo {command}\n")
        }
    }
}

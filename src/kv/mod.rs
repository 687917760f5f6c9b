mod command;

pub use command::Command;

use crate::error::Result;
use crate::raft;

use log::{info, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::Path;

/// A key-value store backed by an append-only journal.
///
/// The journal holds one canonical command per line (`SET "<key>" "<value>"`
/// or `DEL "<key>"`); replaying it in order from an empty store reproduces
/// the in-memory state. Every mutation is journaled and fsynced before it
/// becomes visible in memory, so a crash between the two restores the
/// mutation on the next open. Reads are never journaled.
pub struct Store {
    /// The in-memory state.
    data: HashMap<String, String>,
    /// The journal append handle. None if the journal could not be opened,
    /// in which case the store still works but mutations are volatile.
    journal: Option<File>,
}

impl Store {
    /// Opens a store, replaying the journal at the given path if present and
    /// creating its directory if absent. A journal that cannot be opened is
    /// logged and ignored, leaving an empty, volatile store.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(dir) {
                warn!("Failed to create journal directory {}: {err}", dir.display());
            }
        }

        let mut data = HashMap::new();
        match File::open(path) {
            Ok(file) => Self::replay(file, path, &mut data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Journal {} not found, starting with an empty state", path.display())
            }
            Err(err) => {
                warn!("Failed to open journal {}: {err}; starting with an empty state", path.display())
            }
        }

        let journal = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("Failed to open journal {} for writing: {err}", path.display());
                None
            }
        };
        Ok(Self { data, journal })
    }

    /// Replays journaled commands into the given state.
    fn replay(file: File, path: &Path, data: &mut HashMap<String, String>) {
        let mut count = 0;
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("Failed reading journal {}: {err}; stopping replay", path.display());
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Ok(Command::Set { key, value }) => {
                    data.insert(key, value);
                }
                Ok(Command::Del { key }) => {
                    data.remove(&key);
                }
                Ok(command) => warn!("Skipping non-mutating journal entry {command:?}"),
                Err(err) => warn!("Skipping malformed journal line '{line}': {err}"),
            }
            count += 1;
        }
        info!("Replayed {count} commands from {}", path.display());
    }

    /// Applies a command and returns its response text. Mutations are
    /// journaled and fsynced before they become visible. Command-level
    /// errors (bad arguments, unknown commands) are reported in the response
    /// text and change nothing; an Err is only returned for journal I/O
    /// failures.
    pub fn apply(&mut self, input: &str) -> Result<String> {
        let command = match Command::parse(input) {
            Ok(command) => command,
            Err(response) => return Ok(format!("{response}\n")),
        };
        if let Some(line) = command.journal_line() {
            self.append_journal(&line)?;
        }
        Ok(match command {
            Command::Set { key, value } => {
                self.data.insert(key, value);
                "OK\n".to_string()
            }
            Command::Del { key } => match self.data.remove(&key) {
                Some(_) => "1\n".to_string(),
                None => "0\n".to_string(),
            },
            Command::Get { key } => self.format_get(&key),
            Command::Keys => self.format_keys(),
        })
    }

    /// Executes a read-only command against current state.
    pub fn read(&self, input: &str) -> String {
        match Command::parse(input) {
            Ok(Command::Get { key }) => self.format_get(&key),
            Ok(Command::Keys) => self.format_keys(),
            Ok(command) => format!("ERR command {command:?} is not read-only\n"),
            Err(response) => format!("{response}\n"),
        }
    }

    /// Formats a GET response.
    fn format_get(&self, key: &str) -> String {
        match self.data.get(key) {
            Some(value) => format!("\"{value}\"\n"),
            None => "(nil)\n".to_string(),
        }
    }

    /// Formats a KEYS response. Keys are listed in sorted order, one
    /// numbered line each.
    fn format_keys(&self) -> String {
        if self.data.is_empty() {
            return "(empty list or set)\n".to_string();
        }
        let mut keys: Vec<&String> = self.data.keys().collect();
        keys.sort();
        let mut response = String::new();
        for (i, key) in keys.into_iter().enumerate() {
            response.push_str(&format!("{}) \"{key}\"\n", i + 1));
        }
        response
    }

    /// Appends a line to the journal and syncs it to disk.
    fn append_journal(&mut self, line: &str) -> Result<()> {
        let Some(file) = &mut self.journal else { return Ok(()) };
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }
}

/// The journaled store as a Raft state machine, tracking the applied index.
/// Both the consensus log and the applied index restart from zero: the store
/// recovers its state from the journal, and re-applying backfilled SET/DEL
/// entries is idempotent on it.
pub struct KvState {
    store: Store,
    applied_index: raft::Index,
}

impl KvState {
    pub fn new(store: Store) -> Self {
        Self { store, applied_index: 0 }
    }
}

impl raft::State for KvState {
    fn applied_index(&self) -> raft::Index {
        self.applied_index
    }

    fn apply(&mut self, index: raft::Index, command: &str) -> Result<String> {
        let response = self.store.apply(command)?;
        self.applied_index = index;
        Ok(response)
    }

    fn read(&self, command: &str) -> String {
        self.store.read(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Opens a store on a fresh journal in a temporary directory.
    fn setup() -> (Store, tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().expect("tempdir failed");
        let path = dir.path().join("AOFs").join("kv_store_0.aof");
        let store = Store::open(&path).expect("open failed");
        (store, dir, path)
    }

    #[test]
    fn set_get_del_keys() {
        let (mut store, _dir, _path) = setup();
        assert_eq!(store.apply("SET foo bar").unwrap(), "OK\n");
        assert_eq!(store.apply("GET foo").unwrap(), "\"bar\"\n");
        assert_eq!(store.apply("GET missing").unwrap(), "(nil)\n");
        assert_eq!(store.apply("DEL foo").unwrap(), "1\n");
        assert_eq!(store.apply("DEL foo").unwrap(), "0\n");
        assert_eq!(store.apply("KEYS").unwrap(), "(empty list or set)\n");
    }

    #[test]
    fn keys_lists_sorted_and_quoted() {
        let (mut store, _dir, _path) = setup();
        store.apply("SET b 2").unwrap();
        store.apply("SET a 1").unwrap();
        assert_eq!(store.apply("KEYS").unwrap(), "1) \"a\"\n2) \"b\"\n");
    }

    #[test]
    fn errors_change_nothing() {
        let (mut store, _dir, path) = setup();
        assert_eq!(store.apply("SET k").unwrap(), "ERR wrong number of arguments for 'SET'\n");
        assert_eq!(store.apply("NOPE k v").unwrap(), "ERR unknown command 'NOPE'\n");
        assert_eq!(store.apply("").unwrap(), "ERR empty command\n");
        assert_eq!(store.apply("KEYS").unwrap(), "(empty list or set)\n");
        // Nothing was journaled either.
        assert_eq!(std::fs::read_to_string(path).unwrap(), "");
    }

    #[test]
    fn journal_is_canonical() {
        let (mut store, _dir, path) = setup();
        store.apply("SET foo bar").unwrap();
        store.apply("SET b \"two words\"").unwrap();
        store.apply("GET foo").unwrap();
        store.apply("DEL foo").unwrap();
        store.apply("KEYS").unwrap();
        // Reads are not journaled; mutations are quoted canonically.
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "SET \"foo\" \"bar\"\nSET \"b\" \"two words\"\nDEL \"foo\"\n"
        );
    }

    #[test]
    fn journal_replays_on_open() {
        let (mut store, _dir, path) = setup();
        store.apply("SET a 1").unwrap();
        store.apply("SET b \"two words\"").unwrap();
        store.apply("DEL a").unwrap();
        drop(store);

        let mut store = Store::open(&path).unwrap();
        assert_eq!(store.apply("GET a").unwrap(), "(nil)\n");
        assert_eq!(store.apply("GET b").unwrap(), "\"two words\"\n");
        assert_eq!(store.apply("KEYS").unwrap(), "1) \"b\"\n");
    }

    #[test]
    fn replay_is_idempotent() {
        let (mut store, _dir, path) = setup();
        store.apply("SET a 1").unwrap();
        store.apply("SET a 2").unwrap();
        store.apply("SET b x y z").unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        let snapshot = store.data.clone();
        drop(store);
        let store = Store::open(&path).unwrap();
        assert_eq!(store.data, snapshot);
    }

    #[test]
    fn reopened_store_keeps_journaling() {
        let (mut store, _dir, path) = setup();
        store.apply("SET a 1").unwrap();
        drop(store);

        let mut store = Store::open(&path).unwrap();
        store.apply("SET b 2").unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        assert_eq!(store.read("GET a"), "\"1\"\n");
        assert_eq!(store.read("GET b"), "\"2\"\n");
    }

    #[test]
    fn read_serves_gets_and_keys_only() {
        let (mut store, _dir, _path) = setup();
        store.apply("SET a 1").unwrap();
        assert_eq!(store.read("GET a"), "\"1\"\n");
        assert_eq!(store.read("KEYS"), "1) \"a\"\n");
        assert_eq!(store.read("GET nope"), "(nil)\n");
    }

    #[test]
    fn kv_state_tracks_applied_index() {
        use crate::raft::State as _;
        let (store, _dir, _path) = setup();
        let mut state = KvState::new(store);
        assert_eq!(state.applied_index(), 0);
        assert_eq!(state.apply(1, "SET a 1").unwrap(), "OK\n");
        assert_eq!(state.apply(2, "GET a").unwrap(), "\"1\"\n");
        assert_eq!(state.applied_index(), 2);
    }
}

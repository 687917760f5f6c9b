use super::Term;

/// A log index. Index 0 holds the sentinel entry.
pub type Index = u64;

/// A log entry: a state machine command proposed in a leadership term.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    /// The term in which the entry was proposed.
    pub term: Term,
    /// The state machine command.
    pub command: String,
}

/// The Raft log stores the sequence of commands that are replicated across
/// nodes and applied sequentially to the local state machine. Entries are
/// indexed from 0, where index 0 is a sentinel entry with term 0 and an empty
/// command that is never applied; it anchors the prev_log_index/term
/// arithmetic so the first real entry (index 1) has a well-defined
/// predecessor.
///
/// The log is kept in memory only. The state machine below it is journaled,
/// so a restarted node recovers its applied state and is backfilled by the
/// leader from log index 1.
///
/// In the steady state the log is append-only: leaders append via
/// [`Log::append`] and replicate to followers who append via [`Log::splice`].
/// Once an index is replicated to a quorum it is committed via
/// [`Log::commit`], making the prefix up to that index immutable. Uncommitted
/// entries may still be replaced: a follower whose tail diverges from the
/// leader truncates it at the first conflicting entry and splices in the
/// leader's entries (see section 5.3 in the Raft paper).
#[derive(Clone, Debug, PartialEq)]
pub struct Log {
    /// The log entries. entries[0] is the sentinel.
    entries: Vec<Entry>,
    /// The index of the last committed entry.
    commit_index: Index,
}

impl Log {
    /// Creates an empty log, holding only the sentinel entry.
    pub fn new() -> Self {
        Self { entries: vec![Entry { term: 0, command: String::new() }], commit_index: 0 }
    }

    /// Returns the number of entries, including the sentinel. The last entry
    /// is at index len() - 1.
    pub fn len(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns the index of the last entry (0 if the log only holds the
    /// sentinel).
    pub fn last_index(&self) -> Index {
        self.len() - 1
    }

    /// Returns the term of the last entry.
    pub fn last_term(&self) -> Term {
        self.entries.last().expect("log without sentinel").term
    }

    /// Returns the index of the last committed entry.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Fetches the entry at an index, if it exists.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Appends a command to the log at the given term, returning its index.
    /// Only called on leaders, which never overwrite or delete their own
    /// entries.
    pub fn append(&mut self, term: Term, command: String) -> Index {
        assert!(term >= self.last_term(), "term regression {} → {}", self.last_term(), term);
        self.entries.push(Entry { term, command });
        self.last_index()
    }

    /// Splices entries received from a leader into the log, following the
    /// entry at prev_index (which the caller must have verified with
    /// [`Log::has`]). Entries already present with the same term are left
    /// untouched; at the first conflicting entry the local tail is truncated
    /// and replaced with the received entries. Returns the new last index.
    ///
    /// Truncation only ever happens on divergence, so the committed prefix
    /// (which every true leader shares) is never rewritten.
    pub fn splice(&mut self, prev_index: Index, entries: Vec<Entry>) -> Index {
        assert!(prev_index < self.len(), "splice at {} past log end {}", prev_index, self.len());

        for (i, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + i as Index;
            if let Some(existing) = self.get(index) {
                if existing.term == entry.term {
                    // Log Matching: same index and term implies same command.
                    debug_assert_eq!(existing.command, entry.command, "command mismatch at {index}");
                    continue;
                }
                assert!(index > self.commit_index, "splice conflict below commit index {index}");
                self.entries.truncate(index as usize);
            }
            assert_eq!(index, self.len(), "splice would leave a gap at {index}");
            self.entries.push(entry);
        }
        self.last_index()
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index >= self.commit_index, "commit regression {} → {}", self.commit_index, index);
        assert!(index <= self.last_index(), "can't commit non-existent index {index}");
        self.commit_index = index;
        index
    }

    /// Returns a copy of the entries from the given index onwards, for
    /// replication to a follower.
    pub fn entries_from(&self, index: Index) -> Vec<Entry> {
        self.entries.iter().skip(index as usize).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, command: &str) -> Entry {
        Entry { term, command: command.to_string() }
    }

    #[test]
    fn new_holds_sentinel() {
        let log = Log::new();
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.get(0), Some(&entry(0, "")));
        assert_eq!(log.get(1), None);
        assert!(log.has(0, 0));
    }

    #[test]
    fn append_advances_tail() {
        let mut log = Log::new();
        assert_eq!(log.append(1, "SET a 1".to_string()), 1);
        assert_eq!(log.append(1, "SET b 2".to_string()), 2);
        assert_eq!(log.append(3, "DEL a".to_string()), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 3);
        assert!(log.has(2, 1));
        assert!(!log.has(2, 3));
        assert!(!log.has(4, 3));
    }

    #[test]
    fn splice_appends_after_prev() {
        let mut log = Log::new();
        log.splice(0, vec![entry(1, "a"), entry(1, "b")]);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.get(1), Some(&entry(1, "a")));
        assert_eq!(log.get(2), Some(&entry(1, "b")));
    }

    #[test]
    fn splice_is_idempotent() {
        let mut log = Log::new();
        log.splice(0, vec![entry(1, "a"), entry(2, "b")]);
        let before = log.clone();
        log.splice(0, vec![entry(1, "a"), entry(2, "b")]);
        log.splice(1, vec![entry(2, "b")]);
        assert_eq!(log, before);
    }

    #[test]
    fn splice_truncates_conflicting_tail() {
        let mut log = Log::new();
        log.splice(0, vec![entry(1, "a"), entry(1, "b"), entry(1, "c")]);
        // A new leader in term 2 replaces the tail after index 1.
        log.splice(1, vec![entry(2, "x"), entry(2, "y")]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.get(1), Some(&entry(1, "a")));
        assert_eq!(log.get(2), Some(&entry(2, "x")));
        assert_eq!(log.get(3), Some(&entry(2, "y")));
    }

    #[test]
    fn splice_keeps_matching_longer_tail() {
        let mut log = Log::new();
        log.splice(0, vec![entry(1, "a"), entry(1, "b")]);
        // A delayed message with a matching prefix must not shorten the log.
        log.splice(0, vec![entry(1, "a")]);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn commit_tracks_prefix() {
        let mut log = Log::new();
        log.append(1, "a".to_string());
        log.append(1, "b".to_string());
        assert_eq!(log.commit(1), 1);
        assert_eq!(log.commit_index(), 1);
        assert_eq!(log.commit(2), 2);
    }

    #[test]
    #[should_panic(expected = "commit regression")]
    fn commit_cannot_regress() {
        let mut log = Log::new();
        log.append(1, "a".to_string());
        log.append(1, "b".to_string());
        log.commit(2);
        log.commit(1);
    }

    #[test]
    fn entries_from_returns_suffix() {
        let mut log = Log::new();
        log.append(1, "a".to_string());
        log.append(1, "b".to_string());
        assert_eq!(log.entries_from(2), vec![entry(1, "b")]);
        assert_eq!(log.entries_from(3), vec![]);
    }
}

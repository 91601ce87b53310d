use super::api::grpc;

/// Logical log position, 0-based. -1 is the "nothing yet" sentinel used for
/// commit/apply cursors, match indices and the snapshot watermark.
pub type LogIndex = i64;
pub type Term = u64;

/// Ordered (term, command) sequence with a snapshot watermark. Entries at or
/// below the watermark have been folded into a snapshot and discarded; the
/// logical index space is unaffected by compaction.
///
/// Owned exclusively by the consensus task, so no internal locking.
pub struct RaftLog {
    entries: Vec<grpc::LogEntry>,
    last_included_idx: LogIndex,
    last_included_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_included_idx: -1,
            last_included_term: 0,
        }
    }

    pub fn last_included_idx(&self) -> LogIndex {
        self.last_included_idx
    }

    pub fn last_included_term(&self) -> Term {
        self.last_included_term
    }

    /// First index still present as an entry.
    pub fn first_idx(&self) -> LogIndex {
        self.last_included_idx + 1
    }

    pub fn last_idx(&self) -> LogIndex {
        self.last_included_idx + self.entries.len() as LogIndex
    }

    /// Term of the last entry, falling back to the watermark's term when the
    /// log is empty after compaction (0 when truly empty).
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.last_included_term)
    }

    pub fn append(&mut self, entry: grpc::LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_idx()
    }

    fn offset(&self, idx: LogIndex) -> Option<usize> {
        if idx < self.first_idx() || idx > self.last_idx() {
            return None;
        }
        Some((idx - self.first_idx()) as usize)
    }

    pub fn get(&self, idx: LogIndex) -> Option<&grpc::LogEntry> {
        self.offset(idx).map(|off| &self.entries[off])
    }

    /// Term at a logical index. The watermark itself answers with the
    /// snapshot's term; indices below it are gone.
    pub fn term_at(&self, idx: LogIndex) -> Option<Term> {
        if idx == self.last_included_idx {
            return Some(self.last_included_term);
        }
        self.get(idx).map(|e| e.term)
    }

    pub fn entries_from(&self, idx: LogIndex) -> Vec<grpc::LogEntry> {
        match self.offset(idx) {
            Some(off) => self.entries[off..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Drop the entry at `idx` and everything after it.
    pub fn truncate_from(&mut self, idx: LogIndex) {
        debug_assert!(idx >= self.first_idx(), "cannot truncate compacted prefix");
        let keep = (idx - self.first_idx()).max(0) as usize;
        self.entries.truncate(keep);
    }

    /// Fold entries through `idx` into the watermark, retaining the suffix.
    pub fn compact_through(&mut self, idx: LogIndex, term: Term) {
        debug_assert!(idx > self.last_included_idx && idx <= self.last_idx());
        let drop = ((idx - self.last_included_idx) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.last_included_idx = idx;
        self.last_included_term = term;
    }

    /// Adopt a snapshot's watermark. The suffix survives only if our entry at
    /// the watermark agrees with the snapshot's term; otherwise the whole log
    /// is superseded.
    pub fn install(&mut self, idx: LogIndex, term: Term) {
        if idx <= self.last_idx() && self.term_at(idx) == Some(term) {
            self.compact_through(idx, term);
        } else {
            self.entries.clear();
            self.last_included_idx = idx;
            self.last_included_term = term;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: Term, key: &str) -> grpc::LogEntry {
        grpc::LogEntry {
            term,
            command: Some(grpc::Command {
                key: key.to_string(),
                value: "v".to_string(),
            }),
        }
    }

    #[test]
    fn empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.last_idx(), -1);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(-1), Some(0));
        assert_eq!(log.term_at(0), None);
        assert!(log.get(0).is_none());
    }

    #[test]
    fn append_and_get() {
        let mut log = RaftLog::new();
        assert_eq!(log.append(entry(1, "a")), 0);
        assert_eq!(log.append(entry(1, "b")), 1);
        assert_eq!(log.append(entry(2, "c")), 2);
        assert_eq!(log.last_idx(), 2);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.get(2).unwrap().command.as_ref().unwrap().key, "c");
    }

    #[test]
    fn truncate_drops_suffix() {
        let mut log = RaftLog::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.append(entry(2, "c"));
        log.truncate_from(1);
        assert_eq!(log.last_idx(), 0);
        assert_eq!(log.last_term(), 1);
        assert!(log.get(1).is_none());
    }

    #[test]
    fn compaction_retains_suffix() {
        let mut log = RaftLog::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.append(entry(2, "c"));
        log.compact_through(1, 1);

        assert_eq!(log.last_included_idx(), 1);
        assert_eq!(log.last_included_term(), 1);
        assert_eq!(log.first_idx(), 2);
        assert_eq!(log.last_idx(), 2);
        // the watermark answers for its own index, older indices are gone
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.term_at(0), None);
        assert_eq!(log.get(2).unwrap().command.as_ref().unwrap().key, "c");
        // logical indices keep working after the base shift
        assert_eq!(log.append(entry(2, "d")), 3);
        assert_eq!(log.entries_from(3).len(), 1);
    }

    #[test]
    fn last_term_falls_back_to_watermark() {
        let mut log = RaftLog::new();
        log.append(entry(3, "a"));
        log.compact_through(0, 3);
        assert_eq!(log.last_idx(), 0);
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn install_keeps_matching_suffix() {
        let mut log = RaftLog::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        log.append(entry(2, "c"));
        log.install(1, 1);
        assert_eq!(log.last_included_idx(), 1);
        assert_eq!(log.last_idx(), 2);
        assert_eq!(log.term_at(2), Some(2));
    }

    #[test]
    fn install_discards_conflicting_log() {
        let mut log = RaftLog::new();
        log.append(entry(1, "a"));
        log.append(entry(1, "b"));
        // snapshot claims a different term at index 1
        log.install(1, 4);
        assert_eq!(log.last_included_idx(), 1);
        assert_eq!(log.last_included_term(), 4);
        assert_eq!(log.last_idx(), 1);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn install_past_the_end_clears_everything() {
        let mut log = RaftLog::new();
        log.append(entry(1, "a"));
        log.install(7, 3);
        assert_eq!(log.last_included_idx(), 7);
        assert_eq!(log.last_idx(), 7);
        assert_eq!(log.first_idx(), 8);
        assert!(log.get(0).is_none());
    }
}

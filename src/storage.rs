use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// Durable-state façade the consensus core depends on: the log plus the
/// current term and vote. Implementations must flush to durable media before
/// returning from any mutating method — the node acts on the new values (and
/// answers RPCs) as soon as the call returns.
pub trait Storage<C> {
    type Error;

    /// Get the current term.
    fn current_term(&self) -> Result<Term, Self::Error>;

    /// Get the candidate this server voted for in the current term.
    fn voted_for(&self) -> Result<Option<NodeId>, Self::Error>;

    /// Persist the term and vote together, in one durable write. A term
    /// change and its vote reset must not be separable by a crash, or a
    /// restarted server can vote twice in the same term.
    fn set_vote_state(&mut self, term: Term, voted_for: Option<NodeId>)
        -> Result<(), Self::Error>;

    /// Index of the last log entry, 0 if the log is empty.
    fn last_log_index(&self) -> Result<LogIndex, Self::Error>;

    /// Term of the last log entry, 0 if the log is empty.
    fn last_log_term(&self) -> Result<Term, Self::Error>;

    /// Term of the entry at `index`. Index 0 reads as term 0; past-the-end
    /// reads as None.
    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, Self::Error>;

    /// Get a log entry by index.
    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry<C>>, Self::Error>;

    /// Append an entry to the log. Returns the index of the new entry.
    fn append(&mut self, entry: LogEntry<C>) -> Result<LogIndex, Self::Error>;

    /// Delete every entry with index greater than `prev`.
    fn truncate_after(&mut self, prev: LogIndex) -> Result<(), Self::Error>;
}

/// In-memory storage for testing.
pub struct MemoryStorage<C> {
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry<C>>,
}

impl<C> MemoryStorage<C> {
    pub fn new() -> Self {
        Self {
            current_term: Term::default(),
            voted_for: None,
            log: Vec::new(),
        }
    }
}

impl<C> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> Storage<C> for MemoryStorage<C> {
    type Error = std::convert::Infallible;

    fn current_term(&self) -> Result<Term, Self::Error> {
        Ok(self.current_term)
    }

    fn voted_for(&self) -> Result<Option<NodeId>, Self::Error> {
        Ok(self.voted_for)
    }

    fn set_vote_state(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), Self::Error> {
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn last_log_index(&self) -> Result<LogIndex, Self::Error> {
        Ok(LogIndex::from_length(self.log.len()))
    }

    fn last_log_term(&self) -> Result<Term, Self::Error> {
        Ok(self.log.last().map(|e| e.term).unwrap_or_default())
    }

    fn term_at(&self, index: LogIndex) -> Result<Option<Term>, Self::Error> {
        match index.to_array_index() {
            None => Ok(Some(Term::default())),
            Some(idx) => Ok(self.log.get(idx).map(|e| e.term)),
        }
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry<C>>, Self::Error> {
        match index.to_array_index() {
            None => Ok(None),
            Some(idx) => Ok(self.log.get(idx).cloned()),
        }
    }

    fn append(&mut self, entry: LogEntry<C>) -> Result<LogIndex, Self::Error> {
        self.log.push(entry);
        Ok(LogIndex::from_length(self.log.len()))
    }

    fn truncate_after(&mut self, prev: LogIndex) -> Result<(), Self::Error> {
        self.log.truncate(prev.to_array_index().map_or(0, |i| i + 1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Membership;
    use crate::types::EntryPayload;

    #[test]
    fn vote_state_round_trips() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();

        assert_eq!(storage.current_term().unwrap(), Term::default());
        assert_eq!(storage.voted_for().unwrap(), None);

        storage
            .set_vote_state(Term::from(5), Some(NodeId::from(3)))
            .unwrap();

        assert_eq!(storage.current_term().unwrap(), Term::from(5));
        assert_eq!(storage.voted_for().unwrap(), Some(NodeId::from(3)));
    }

    #[test]
    fn append_and_read() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();

        let idx = storage
            .append(LogEntry::command(Term::from(1), "a".to_string()))
            .unwrap();
        assert_eq!(idx, LogIndex::from(1));

        let idx = storage
            .append(LogEntry::command(Term::from(2), "b".to_string()))
            .unwrap();
        assert_eq!(idx, LogIndex::from(2));

        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(2));
        assert_eq!(storage.last_log_term().unwrap(), Term::from(2));
        assert_eq!(storage.term_at(LogIndex::from(1)).unwrap(), Some(Term::from(1)));
        assert_eq!(storage.term_at(LogIndex::default()).unwrap(), Some(Term::default()));
        assert_eq!(storage.term_at(LogIndex::from(9)).unwrap(), None);
        assert_eq!(
            storage.entry(LogIndex::from(1)).unwrap().map(|e| e.payload),
            Some(EntryPayload::Command("a".to_string()))
        );
    }

    #[test]
    fn truncate_after_keeps_prefix() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();

        for cmd in ["a", "b", "c"] {
            storage
                .append(LogEntry::command(Term::from(1), cmd.to_string()))
                .unwrap();
        }

        storage.truncate_after(LogIndex::from(1)).unwrap();
        assert_eq!(storage.last_log_index().unwrap(), LogIndex::from(1));

        storage.truncate_after(LogIndex::default()).unwrap();
        assert_eq!(storage.last_log_index().unwrap(), LogIndex::default());
    }

    #[test]
    fn config_entry_round_trips() {
        let mut storage: MemoryStorage<String> = MemoryStorage::new();
        let config = Membership::stable([NodeId::from(1), NodeId::from(2)]);

        storage
            .append(LogEntry::config(Term::from(1), config.clone()))
            .unwrap();

        assert_eq!(
            storage
                .entry(LogIndex::from(1))
                .unwrap()
                .and_then(|e| e.as_config().cloned()),
            Some(config)
        );
    }
}

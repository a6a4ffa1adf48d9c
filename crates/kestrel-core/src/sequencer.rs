//! Process-wide monotonic sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("sequencer store: {0}")]
    Store(#[source] std::io::Error),
}

/// Persistence contract for the sequencer. The storage format belongs to
/// the collaborator behind this trait.
pub trait SequencerStore: Send + Sync {
    /// Returns the last persisted value, or `None` for a fresh store.
    fn load(&self) -> Result<Option<u64>, SequencerError>;
    fn store(&self, value: u64) -> Result<(), SequencerError>;
    fn close(&self) -> Result<(), SequencerError>;
}

/// Store that never persists. Restarts begin from scratch.
pub struct NullSequencerStore;

impl SequencerStore for NullSequencerStore {
    fn load(&self) -> Result<Option<u64>, SequencerError> {
        Ok(None)
    }

    fn store(&self, _value: u64) -> Result<(), SequencerError> {
        Ok(())
    }

    fn close(&self) -> Result<(), SequencerError> {
        Ok(())
    }
}

/// Monotonic counter assigning stable ordering numbers to published
/// events. Restoration from a store resumes strictly above the persisted
/// value: rounding up is permitted, going back never is.
pub struct Sequencer {
    value: AtomicU64,
    store: Box<dyn SequencerStore>,
}

impl Sequencer {
    pub fn open(store: Box<dyn SequencerStore>) -> Result<Self, SequencerError> {
        let initial = match store.load()? {
            Some(persisted) => persisted + 1,
            None => 1,
        };
        Ok(Self {
            value: AtomicU64::new(initial),
            store,
        })
    }

    /// Sequencer without persistence.
    pub fn in_memory() -> Self {
        Self::open(Box::new(NullSequencerStore)).expect("null store cannot fail")
    }

    /// Reads the current value without allocating it.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Allocates the next value, returning the new current one.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn store(&self) -> Result<(), SequencerError> {
        self.store.store(self.get())
    }

    pub fn close(&self) -> Result<(), SequencerError> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct MemStore(Arc<Mutex<Option<u64>>>);

    impl SequencerStore for MemStore {
        fn load(&self) -> Result<Option<u64>, SequencerError> {
            Ok(*self.0.lock().unwrap())
        }

        fn store(&self, value: u64) -> Result<(), SequencerError> {
            *self.0.lock().unwrap() = Some(value);
            Ok(())
        }

        fn close(&self) -> Result<(), SequencerError> {
            Ok(())
        }
    }

    #[test]
    fn fresh_sequencer_starts_at_one() {
        let sequencer = Sequencer::in_memory();
        assert_eq!(sequencer.get(), 1);
        assert_eq!(sequencer.increment(), 2);
        assert_eq!(sequencer.get(), 2);
    }

    #[test]
    fn restart_resumes_strictly_above_stored_value() {
        let slot = Arc::new(Mutex::new(None));
        let sequencer = Sequencer::open(Box::new(MemStore(slot.clone()))).unwrap();
        assert_eq!(sequencer.get(), 1);
        sequencer.increment();
        sequencer.increment();
        sequencer.store().unwrap();
        sequencer.close().unwrap();

        let restarted = Sequencer::open(Box::new(MemStore(slot))).unwrap();
        assert_eq!(restarted.get(), 4);
    }
}

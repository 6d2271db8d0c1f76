//! The Completable: a single-producer, multi-consumer one-shot cell.
//!
//! One is allocated per data node at execution start. Consumers await the
//! cell and suspend until it is filled; exactly one producer completes it.
//! Failure travels through the same cell: poisoning transitions it to an
//! error state that every pending and future await observes.
//!
//! Built on `tokio::sync::watch`, which gives multi-await and loss-free
//! last-value semantics; single-fill is debug-asserted.

use tokio::sync::watch;

use flowlang_core::value::Value;

use crate::error::NodeError;

#[derive(Debug, Clone, PartialEq)]
enum CellState {
    Empty,
    Filled(Value),
    Poisoned(NodeError),
}

/// A one-shot value cell for a data node.
#[derive(Debug)]
pub struct Completable {
    tx: watch::Sender<CellState>,
}

impl Default for Completable {
    fn default() -> Self {
        Self::new()
    }
}

impl Completable {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CellState::Empty);
        Completable { tx }
    }

    /// Fills the cell. Filling twice is a runtime bug.
    pub fn complete(&self, value: Value) {
        debug_assert!(
            matches!(*self.tx.borrow(), CellState::Empty),
            "completable filled twice"
        );
        self.tx.send_replace(CellState::Filled(value));
    }

    /// Transitions an empty cell to the poisoned state. A cell that already
    /// holds a value keeps it.
    pub fn poison(&self, error: NodeError) {
        self.tx.send_if_modified(|state| {
            if matches!(state, CellState::Empty) {
                *state = CellState::Poisoned(error);
                true
            } else {
                false
            }
        });
    }

    /// True until completed or poisoned.
    pub fn is_empty(&self) -> bool {
        matches!(*self.tx.borrow(), CellState::Empty)
    }

    /// The filled value, if any.
    pub fn value(&self) -> Option<Value> {
        match &*self.tx.borrow() {
            CellState::Filled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// A reader that can await the cell's resolution.
    pub fn reader(&self) -> CellReader {
        CellReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// One consumer's handle on a [`Completable`].
#[derive(Debug, Clone)]
pub struct CellReader {
    rx: watch::Receiver<CellState>,
}

impl CellReader {
    /// Suspends until the cell resolves; returns the value or the poison
    /// error. A dropped producer reads as cancellation.
    pub async fn await_value(&mut self) -> Result<Value, NodeError> {
        let resolved = self
            .rx
            .wait_for(|state| !matches!(state, CellState::Empty))
            .await;
        match resolved {
            Ok(state) => match &*state {
                CellState::Filled(value) => Ok(value.clone()),
                CellState::Poisoned(error) => Err(error.clone()),
                CellState::Empty => unreachable!("wait_for excludes empty"),
            },
            Err(_) => Err(NodeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn await_suspends_until_complete() {
        let cell = Completable::new();
        let mut reader = cell.reader();
        let waiter = tokio::spawn(async move { reader.await_value().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "consumer must stay suspended");

        cell.complete(Value::Int(42));
        assert_eq!(waiter.await.unwrap().unwrap(), Value::Int(42));
    }

    #[tokio::test]
    async fn multiple_consumers_observe_one_fill() {
        let cell = Completable::new();
        let readers: Vec<_> = (0..4).map(|_| cell.reader()).collect();
        let tasks: Vec<_> = readers
            .into_iter()
            .map(|mut r| tokio::spawn(async move { r.await_value().await }))
            .collect();
        cell.complete(Value::String("x".into()));
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Value::String("x".into()));
        }
    }

    #[tokio::test]
    async fn poisoned_cell_yields_error_to_all_consumers() {
        let cell = Completable::new();
        let mut early = cell.reader();
        cell.poison(NodeError::Cancelled);
        assert_eq!(early.await_value().await.unwrap_err(), NodeError::Cancelled);
        // A reader created after poisoning sees the same error.
        let mut late = cell.reader();
        assert_eq!(late.await_value().await.unwrap_err(), NodeError::Cancelled);
    }

    #[tokio::test]
    async fn poison_does_not_overwrite_a_value() {
        let cell = Completable::new();
        cell.complete(Value::Int(1));
        cell.poison(NodeError::Cancelled);
        assert_eq!(cell.value(), Some(Value::Int(1)));
        let mut reader = cell.reader();
        assert_eq!(reader.await_value().await.unwrap(), Value::Int(1));
    }

    #[tokio::test]
    #[should_panic(expected = "completable filled twice")]
    async fn double_fill_is_a_bug() {
        let cell = Completable::new();
        cell.complete(Value::Int(1));
        cell.complete(Value::Int(2));
    }
}

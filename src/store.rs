//! The shared state tree.
//!
//! [`StateStore`] holds the tree behind an `Arc` that is swapped, never
//! mutated in place: a write clones the tree, runs one reducer over the
//! owned slice and publishes the result in a single pointer swap. Readers
//! therefore see either the old or the new tree, and a snapshot taken before
//! a write stays valid (and pointer-stable for selector memos) afterwards.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::StoreError;
use crate::reducer::SliceReducer;
use crate::selector::Selector;

/// Owner record for a slice: reducer type id and type name.
type SliceOwner = (TypeId, &'static str);

/// Single-root state tree mutated only through [`SliceReducer`]s.
///
/// `Clone` is cheap; all clones address the same tree.
pub struct StateStore<S> {
    inner: Arc<StoreInner<S>>,
}

struct StoreInner<S> {
    state: RwLock<Arc<S>>,
    owners: Mutex<HashMap<&'static str, SliceOwner>>,
    version: watch::Sender<u64>,
}

impl<S> Clone for StateStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for StateStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slices: Vec<&'static str> = self.inner.owners.lock().keys().copied().collect();
        f.debug_struct("StateStore")
            .field("version", &*self.inner.version.borrow())
            .field("owned_slices", &slices)
            .finish()
    }
}

impl<S> StateStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a store holding `initial`.
    pub fn new(initial: S) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(Arc::new(initial)),
                owners: Mutex::new(HashMap::new()),
                version,
            }),
        }
    }

    /// Current tree. Holding the snapshot does not block writers.
    pub fn snapshot(&self) -> Arc<S> {
        Arc::clone(&self.inner.state.read())
    }

    /// Run a pure read function against the current tree.
    pub fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        let state = self.snapshot();
        f(&state)
    }

    /// Read through a memoized selector.
    pub fn select<T>(&self, selector: &Selector<S, T>) -> Arc<T>
    where
        T: Send + Sync + 'static,
    {
        selector.select(&self.snapshot())
    }

    /// Apply `action` to the slice owned by reducer `R`.
    ///
    /// The first reducer type that writes a slice name becomes its owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SliceAliased`] if another reducer type already
    /// owns `R::SLICE`. The tree is left untouched.
    pub fn write<R>(&self, action: &R::Action) -> Result<(), StoreError>
    where
        R: SliceReducer<State = S>,
    {
        self.claim::<R>()?;

        {
            let mut current = self.inner.state.write();
            let mut next = S::clone(&current);
            let slice = R::slice(&next).clone();
            *R::slice_mut(&mut next) = R::reduce(slice, action);
            *current = Arc::new(next);
        }

        let mut version = 0;
        self.inner.version.send_modify(|v| {
            *v += 1;
            version = *v;
        });
        tracing::trace!(slice = R::SLICE, version, "slice written");
        Ok(())
    }

    /// Number of writes applied so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Receiver that is notified with the new version after every write.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    fn claim<R>(&self) -> Result<(), StoreError>
    where
        R: SliceReducer<State = S>,
    {
        let writer = std::any::type_name::<R>();
        let mut owners = self.inner.owners.lock();
        let (owner_id, owner_name) = *owners
            .entry(R::SLICE)
            .or_insert((TypeId::of::<R>(), writer));
        if owner_id != TypeId::of::<R>() {
            tracing::error!(slice = R::SLICE, owner = owner_name, writer, "aliased slice write");
            return Err(StoreError::SliceAliased {
                slice: R::SLICE,
                owner: owner_name,
                writer,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::test_fixtures::*;

    #[test]
    fn write_replaces_only_the_owned_slice() {
        let store = StateStore::new(TestState::default());
        store.write::<CounterReducer>(&CounterAction::Add(3)).unwrap();
        store.write::<LogReducer>(&"hello".to_string()).unwrap();

        let state = store.snapshot();
        assert_eq!(state.counter, 3);
        assert_eq!(state.log, vec!["hello".to_string()]);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn snapshot_taken_before_write_is_unchanged() {
        let store = StateStore::new(TestState::default());
        let before = store.snapshot();
        store.write::<CounterReducer>(&CounterAction::Increment).unwrap();
        assert_eq!(before.counter, 0);
        assert_eq!(store.read(|s| s.counter), 1);
        assert!(!Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn second_reducer_on_same_slice_is_refused() {
        let store = StateStore::new(TestState::default());
        store.write::<CounterReducer>(&CounterAction::Add(2)).unwrap();

        let err = store.write::<RogueCounterReducer>(&100).unwrap_err();
        assert!(matches!(err, StoreError::SliceAliased { slice: "counter", .. }));
        assert_eq!(store.read(|s| s.counter), 2);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn selector_memo_hits_until_write() {
        let store = StateStore::new(TestState::default());
        let doubled = Selector::new("doubled", |s: &TestState| s.counter * 2);

        let a = store.select(&doubled);
        let b = store.select(&doubled);
        assert!(Arc::ptr_eq(&a, &b));

        store.write::<LogReducer>(&"unrelated".to_string()).unwrap();
        let c = store.select(&doubled);
        assert_eq!(*c, 0);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn same_action_on_same_slice_is_structurally_equal() {
        let left = StateStore::new(TestState::default());
        let right = StateStore::new(TestState::default());
        for store in [&left, &right] {
            store.write::<CounterReducer>(&CounterAction::Add(4)).unwrap();
            store.write::<LogReducer>(&"x".to_string()).unwrap();
        }
        assert_eq!(*left.snapshot(), *right.snapshot());
    }

    #[tokio::test]
    async fn changes_receiver_observes_writes() {
        let store = StateStore::new(TestState::default());
        let mut changes = store.changes();
        store.write::<CounterReducer>(&CounterAction::Increment).unwrap();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);
    }
}

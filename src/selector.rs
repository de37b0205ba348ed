//! Memoized selectors.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type SelectFn<S, T> = dyn Fn(&S) -> T + Send + Sync;

/// A pure, memoized read function over the state tree.
///
/// Memoization is keyed by state identity: selecting twice from the same
/// `Arc<S>` returns the same `Arc<T>` (pointer-equal), which lets observers
/// detect "nothing changed" with [`Arc::ptr_eq`] instead of a deep compare.
/// Clones share the memo.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskfold::Selector;
///
/// let len = Selector::new("len", |s: &Vec<u32>| s.len());
/// let state = Arc::new(vec![1, 2, 3]);
/// let a = len.select(&state);
/// let b = len.select(&state);
/// assert_eq!(*a, 3);
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct Selector<S, T> {
    name: &'static str,
    f: Arc<SelectFn<S, T>>,
    memo: Arc<Mutex<Option<(Arc<S>, Arc<T>)>>>,
}

impl<S, T> Clone for Selector<S, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            f: Arc::clone(&self.f),
            memo: Arc::clone(&self.memo),
        }
    }
}

impl<S, T> fmt::Debug for Selector<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("name", &self.name)
            .finish()
    }
}

impl<S, T> Selector<S, T>
where
    S: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Wrap a pure function as a selector.
    pub fn new(name: &'static str, f: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Self {
            name,
            f: Arc::new(f),
            memo: Arc::new(Mutex::new(None)),
        }
    }

    /// Selector name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Derive the value for `state`, reusing the memo on identity hit.
    pub fn select(&self, state: &Arc<S>) -> Arc<T> {
        let mut memo = self.memo.lock();
        if let Some((seen, value)) = memo.as_ref() {
            if Arc::ptr_eq(seen, state) {
                return Arc::clone(value);
            }
        }
        let value = Arc::new((self.f)(state));
        *memo = Some((Arc::clone(state), Arc::clone(&value)));
        value
    }

    /// Compose a selector over this selector's output.
    ///
    /// The derived selector keeps its own memo, keyed on the same state.
    pub fn map<U>(
        &self,
        name: &'static str,
        f: impl Fn(&T) -> U + Send + Sync + 'static,
    ) -> Selector<S, U>
    where
        U: Send + Sync + 'static,
    {
        let inner = self.clone();
        Selector {
            name,
            f: Arc::new(move |state: &S| f(&(inner.f)(state))),
            memo: Arc::new(Mutex::new(None)),
        }
    }
}

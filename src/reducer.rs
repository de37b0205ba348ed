//! Slice reducer trait.

/// A pure write function over one slice of the state tree.
///
/// Each implementing type owns exactly one slice, named by
/// [`SLICE`](SliceReducer::SLICE). The store refuses writes from a second
/// reducer type targeting a slice that already has an owner.
///
/// # Contract
///
/// - [`reduce`](SliceReducer::reduce) must be pure and total: no I/O, no
///   clocks, no randomness. The same `(slice, action)` always yields a
///   structurally equal slice, which is what makes transitions testable
///   without running the scheduler.
/// - Actions a reducer does not care about return the slice unchanged.
pub trait SliceReducer: Send + Sync + 'static {
    /// The whole state tree this reducer's slice lives in.
    type State: Clone + Send + Sync + 'static;

    /// The owned slice.
    type Slice: Clone + Send + Sync + 'static;

    /// Mutation request understood by this reducer.
    type Action: Send + Sync;

    /// Unique name of the owned slice (e.g. `"filter_context"`).
    const SLICE: &'static str;

    /// Borrow the slice out of the tree.
    fn slice(state: &Self::State) -> &Self::Slice;

    /// Mutably borrow the slice. Only the store calls this, on a private copy.
    fn slice_mut(state: &mut Self::State) -> &mut Self::Slice;

    /// Produce the next slice from the current one and an action.
    fn reduce(slice: Self::Slice, action: &Self::Action) -> Self::Slice;
}

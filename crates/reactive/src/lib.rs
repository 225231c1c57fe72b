//! Reactive primitives: a replay-latest observable value and an observable,
//! optionally persisted, ordered mapping built on top of it.

pub mod codec;
pub mod error;
pub mod observable;
pub mod store;

pub use codec::{JsonPairsCodec, StoreCodec};
pub use error::{CodecError, CodecResult, StoreError, StoreResult};
pub use observable::{Change, LiveText, ObservableValue, Subscription};
pub use store::{ReactiveStore, Snapshot, StoreOptions};

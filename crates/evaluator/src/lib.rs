mod engine;
mod index;
mod store;

pub use engine::{rebuild_index, Engine};
pub use index::{Firing, RuleIndex, SymbolIndex};
pub use store::{FireOutcome, FireStore, StoreError};

// Partitioned tick feed abstraction.
//
// Ticks for one symbol always land in one partition, so a single consumer
// observes that symbol's prices in order. Consumer groups track a committed
// offset per partition; commits happen only after downstream effects are
// durable, giving replay-on-crash rather than loss.

mod jsonl;
mod log;
mod mem;

pub use jsonl::{load_jsonl, load_jsonl_reader};
pub use log::{FeedError, SequencedTick, TickLog};
pub use mem::MemLog;

use models::Symbol;
use xxhash_rust::xxh3::xxh3_64;

/// Stable symbol-to-partition routing.
pub fn partition_for(symbol: &Symbol, partitions: u32) -> u32 {
    debug_assert!(partitions > 0);
    (xxh3_64(symbol.as_str().as_bytes()) % u64::from(partitions)) as u32
}

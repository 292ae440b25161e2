use models::Tick;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("unknown partition {0}")]
    UnknownPartition(u32),
    #[error("malformed tick record at line {line}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tick together with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedTick {
    pub partition: u32,
    pub offset: i64,
    pub tick: Tick,
}

/// An ordered, partitioned log of market ticks.
///
/// Offsets within a partition are dense and start at zero. `committed`
/// returns the offset a consumer group should resume reading from, which is
/// zero for a group that has never committed.
#[async_trait::async_trait]
pub trait TickLog: Send + Sync + 'static {
    fn partitions(&self) -> u32;

    /// Read up to `max` ticks from `partition` starting at offset `from`.
    /// An empty result means the consumer is caught up.
    async fn read(
        &self,
        partition: u32,
        from: i64,
        max: u32,
    ) -> Result<Vec<SequencedTick>, FeedError>;

    /// Record that `group` has fully processed offsets below `next`.
    async fn commit(&self, group: &str, partition: u32, next: i64) -> Result<(), FeedError>;

    async fn committed(&self, group: &str, partition: u32) -> Result<i64, FeedError>;
}

use std::collections::HashMap;
use std::sync::Mutex;

use models::Tick;

use crate::log::{FeedError, SequencedTick, TickLog};
use crate::partition_for;

/// In-memory tick log for tests and file-driven runs.
pub struct MemLog {
    partitions: Vec<Mutex<Vec<Tick>>>,
    commits: Mutex<HashMap<(String, u32), i64>>,
}

impl MemLog {
    pub fn new(partitions: u32) -> Self {
        assert!(partitions > 0, "a log needs at least one partition");
        Self {
            partitions: (0..partitions).map(|_| Mutex::new(Vec::new())).collect(),
            commits: Mutex::new(HashMap::new()),
        }
    }

    /// Append a tick to the partition owning its symbol, returning
    /// (partition, offset).
    pub fn append(&self, tick: Tick) -> (u32, i64) {
        let partition = partition_for(&tick.symbol, self.partitions.len() as u32);
        let mut ticks = self.lock(partition);
        ticks.push(tick);
        (partition, ticks.len() as i64 - 1)
    }

    pub fn len(&self, partition: u32) -> usize {
        self.lock(partition).len()
    }

    fn lock(&self, partition: u32) -> std::sync::MutexGuard<'_, Vec<Tick>> {
        self.partitions[partition as usize]
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl TickLog for MemLog {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn read(
        &self,
        partition: u32,
        from: i64,
        max: u32,
    ) -> Result<Vec<SequencedTick>, FeedError> {
        if partition as usize >= self.partitions.len() {
            return Err(FeedError::UnknownPartition(partition));
        }
        let ticks = self.lock(partition);
        let from = from.max(0) as usize;
        Ok(ticks
            .iter()
            .enumerate()
            .skip(from)
            .take(max as usize)
            .map(|(offset, tick)| SequencedTick {
                partition,
                offset: offset as i64,
                tick: tick.clone(),
            })
            .collect())
    }

    async fn commit(&self, group: &str, partition: u32, next: i64) -> Result<(), FeedError> {
        if partition as usize >= self.partitions.len() {
            return Err(FeedError::UnknownPartition(partition));
        }
        let mut commits = self.commits.lock().unwrap_or_else(|p| p.into_inner());
        commits.insert((group.to_string(), partition), next);
        Ok(())
    }

    async fn committed(&self, group: &str, partition: u32) -> Result<i64, FeedError> {
        if partition as usize >= self.partitions.len() {
            return Err(FeedError::UnknownPartition(partition));
        }
        let commits = self.commits.lock().unwrap_or_else(|p| p.into_inner());
        Ok(*commits.get(&(group.to_string(), partition)).unwrap_or(&0))
    }
}

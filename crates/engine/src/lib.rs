mod worker;

pub use worker::{evaluation_worker, WorkerConfig, CONSUMER_GROUP};

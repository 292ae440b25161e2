// Transactional outbox storage and delivery.
//
// A fire is durable only once the rule's ARMED -> FIRED transition and the
// matching outbox row commit in one transaction. Relay workers then claim
// PENDING rows and deliver them at-least-once over a [`Transport`], with the
// row's idempotency key available downstream for deduplication.

mod mem;
mod pg;
mod relay;
mod store;
mod transport;

pub use mem::MemStore;
pub use pg::PgStore;
pub use relay::{Relay, RelayConfig};
pub use store::{RearmScope, RelayStore};
pub use transport::{Transport, WebhookTransport};

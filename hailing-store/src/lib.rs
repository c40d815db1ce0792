pub mod app_config;
pub mod bus;
pub mod database;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
#[cfg(any(feature = "kafka", test))]
mod offsets;
pub mod outbox;
pub mod postgres;
pub mod subscriber;

pub use app_config::Config;
pub use bus::{memory_bus, MemoryBus, MemorySubscription};
pub use database::DbClient;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaSubscription};
pub use memory::MemoryStore;
pub use outbox::OutboxPublisher;
pub use postgres::PgStore;
pub use subscriber::SubscriptionDispatcher;

pub mod adapters;

use anyhow::Context;
use hailing_core::messaging::{EventHandler, MessageBus, Subscription};
use hailing_core::repository::{DeadLetterSink, DispatchStore, OutboxStore};
use hailing_core::services::{AddressService, PushService, RouteService, SettlementService};
use hailing_dispatch::{DispatchApp, DispatchPolicy, NotificationHandler, ProcessHandler, SettlementRequestHandler};
use hailing_store::app_config::{BusBackend, DispatchConfig, FareConfig, StoreBackend};
use hailing_store::{memory_bus, Config, DbClient, MemoryStore, OutboxPublisher, PgStore, SubscriptionDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use adapters::{CoordinateAddressService, LogPushService, LogSettlementService, StraightLineRouteService};

const MEMORY_REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Storage and messaging the node runs on
pub struct Backends {
    pub store: Arc<dyn DispatchStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub bus: Arc<dyn MessageBus>,
    pub subscription: Box<dyn Subscription>,
}

impl Backends {
    /// Single-process backends: in-memory store and in-memory bus.
    pub fn in_memory(store: MemoryStore) -> Self {
        let (bus, subscription) = memory_bus(MEMORY_REDELIVERY_DELAY);
        Self {
            store: Arc::new(store.clone()),
            outbox: Arc::new(store.clone()),
            dead_letters: Arc::new(store),
            bus: Arc::new(bus),
            subscription: Box::new(subscription),
        }
    }

    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let (store, outbox, dead_letters): (Arc<dyn DispatchStore>, Arc<dyn OutboxStore>, Arc<dyn DeadLetterSink>) =
            match config.database.backend {
                StoreBackend::Memory => {
                    info!("Using in-memory store");
                    let store = MemoryStore::new();
                    (Arc::new(store.clone()), Arc::new(store.clone()), Arc::new(store))
                }
                StoreBackend::Postgres => {
                    let db = DbClient::new(&config.database.url, config.database.max_connections)
                        .await
                        .context("failed to connect to postgres")?;
                    db.migrate().await.context("failed to run migrations")?;
                    info!("Connected to postgres");
                    let store = PgStore::new(db.pool.clone());
                    (Arc::new(store.clone()), Arc::new(store.clone()), Arc::new(store))
                }
            };

        let (bus, subscription): (Arc<dyn MessageBus>, Box<dyn Subscription>) = match config.bus.backend {
            BusBackend::Memory => {
                let (bus, subscription) = memory_bus(MEMORY_REDELIVERY_DELAY);
                (Arc::new(bus), Box::new(subscription))
            }
            #[cfg(feature = "kafka")]
            BusBackend::Kafka => {
                let bus = hailing_store::KafkaBus::new(&config.bus).context("failed to create kafka producer")?;
                let subscription = hailing_store::KafkaSubscription::new(&config.bus, bus.clone())
                    .context("failed to create kafka consumer")?;
                info!("Connected to kafka at {}", config.bus.brokers);
                (Arc::new(bus), Box::new(subscription))
            }
            #[cfg(not(feature = "kafka"))]
            BusBackend::Kafka => anyhow::bail!("bus.backend = \"kafka\" requires the `kafka` feature"),
        };

        Ok(Self { store, outbox, dead_letters, bus, subscription })
    }
}

/// External collaborators of the dispatch flow
pub struct Services {
    pub routes: Arc<dyn RouteService>,
    pub addresses: Arc<dyn AddressService>,
    pub push: Arc<dyn PushService>,
    pub settlement: Arc<dyn SettlementService>,
}

impl Services {
    pub fn builtin(fare: &FareConfig) -> Self {
        Self {
            routes: Arc::new(StraightLineRouteService::new(fare.clone())),
            addresses: Arc::new(CoordinateAddressService),
            push: Arc::new(LogPushService),
            settlement: Arc::new(LogSettlementService),
        }
    }
}

pub fn dispatch_policy(config: &DispatchConfig) -> anyhow::Result<DispatchPolicy> {
    let escalation = config.escalation_policy()?;
    let policy = DispatchPolicy::new(
        escalation,
        config.escalation_interval(),
        config.offer_timeout(),
        config.idle_attempt_limit,
    )?;
    Ok(policy)
}

/// Wired but not yet running node
pub struct Node {
    pub app: Arc<DispatchApp>,
    publisher: OutboxPublisher,
    dispatcher: SubscriptionDispatcher,
    subscription: Box<dyn Subscription>,
}

impl Node {
    pub fn new(config: &Config, backends: Backends, services: Services) -> anyhow::Result<Self> {
        let policy = dispatch_policy(&config.dispatch)?;

        let app = Arc::new(DispatchApp::new(
            backends.store.clone(),
            services.routes,
            services.addresses,
        ));
        let handlers: Vec<Arc<dyn EventHandler>> = vec![
            Arc::new(ProcessHandler::new(backends.store, policy)),
            Arc::new(NotificationHandler::new(services.push)),
            Arc::new(SettlementRequestHandler::new(services.settlement)),
        ];

        Ok(Self {
            app,
            publisher: OutboxPublisher::new(backends.outbox, backends.bus, config.outbox.clone()),
            dispatcher: SubscriptionDispatcher::new(handlers, backends.dead_letters, config.subscriber.clone()),
            subscription: backends.subscription,
        })
    }

    /// Starts the outbox publisher and the subscription dispatcher.
    pub fn spawn(self, cancel: CancellationToken) -> RunningNode {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(self.publisher.run(cancel.clone(), done_tx));
        let dispatcher = tokio::spawn(self.dispatcher.run(self.subscription, cancel.clone()));

        RunningNode {
            app: self.app,
            cancel,
            publisher_done: done_rx,
            dispatcher,
        }
    }
}

pub struct RunningNode {
    pub app: Arc<DispatchApp>,
    cancel: CancellationToken,
    publisher_done: oneshot::Receiver<()>,
    dispatcher: JoinHandle<()>,
}

impl RunningNode {
    /// Stops polling and receiving, then waits for in-flight work.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.dispatcher.await.context("subscription dispatcher panicked")?;
        self.publisher_done.await.context("outbox publisher stopped without signalling")?;
        info!("Node stopped");
        Ok(())
    }
}

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use talk_store::{
    IdGenerator, MAX_NODE_ID, MemoryTalkStore, ScopeTags, SnowflakeIds, SqliteTalkStore, TalkStore,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{AmqpConnector, BrokerConnector, BrokerTransport, Role, TransportOptions};
use crate::config::{DistributionMode, FileConfig, HubFileConfig, StorageConfig};
use crate::controller::{ControllerOptions, CustomerController, ServicerController};
use crate::distribution::{
    BrokerDistribution, CustomerDistribution, LocalDistribution, ServicerDistribution,
};
use crate::protocol::{CustomerResponse, ServicerResponse};
use crate::registry::{CustomerMd, ServicerMd};
use crate::session::{CustomerSession, ServicerSession};

/// Both controllers wired to one store and one distribution.
pub struct Hub {
    customer: CustomerController,
    servicer: ServicerController,
    store: Arc<dyn TalkStore>,
    ids: Arc<dyn IdGenerator>,
    mailbox_capacity: usize,
    cancel: CancellationToken,
}

/// Id generator stamped with this process's node number.
pub fn node_ids(config: &HubFileConfig) -> Result<Arc<dyn IdGenerator>> {
    if config.node_id > MAX_NODE_ID {
        bail!("hub.node_id {} is out of range (0..={})", config.node_id, MAX_NODE_ID);
    }
    Ok(Arc::new(SnowflakeIds::new(config.node_id)))
}

pub async fn open_store(
    config: &StorageConfig,
    ids: Arc<dyn IdGenerator>,
) -> Result<Arc<dyn TalkStore>> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryTalkStore::new(ids))),
        StorageConfig::Sqlite { url } => {
            let store = SqliteTalkStore::connect(url, ids)
                .await
                .with_context(|| format!("Failed to open talk store at {}", url))?;
            Ok(Arc::new(store))
        }
    }
}

impl Hub {
    /// Build everything `config` describes. Work stops when `cancel` fires or
    /// [`Hub::shutdown`] is called.
    pub async fn start(config: &FileConfig, cancel: CancellationToken) -> Result<Self> {
        let ids = node_ids(&config.hub)?;
        let store = open_store(&StorageConfig::from_file(&config.storage), ids).await?;
        match config.distribution.mode {
            DistributionMode::Local => Self::local(store, config, cancel).await,
            DistributionMode::Broker => {
                let url = config.distribution.broker_url.clone();
                let connector = Arc::new(AmqpConnector::new(url));
                Self::over_broker(store, connector, config, cancel).await
            }
        }
    }

    pub async fn local(
        store: Arc<dyn TalkStore>,
        config: &FileConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let distribution = Arc::new(LocalDistribution::new(store.clone()));
        let cancel = cancel.child_token();
        Self::assemble(distribution.clone(), distribution, store, config, cancel).await
    }

    /// One transport per role, both dialing through `connector`.
    pub async fn over_broker(
        store: Arc<dyn TalkStore>,
        connector: Arc<dyn BrokerConnector>,
        config: &FileConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let cancel = cancel.child_token();
        let options = TransportOptions::from_file(&config.distribution);
        let customer = BrokerTransport::start(
            connector.clone(),
            Role::Customer,
            options.clone(),
            cancel.clone(),
        );
        let servicer = BrokerTransport::start(connector, Role::Servicer, options, cancel.clone());
        Self::assemble(
            Arc::new(BrokerDistribution::new(store.clone(), customer)),
            Arc::new(BrokerDistribution::new(store.clone(), servicer)),
            store,
            config,
            cancel,
        )
        .await
    }

    async fn assemble(
        customer_distribution: Arc<dyn CustomerDistribution>,
        servicer_distribution: Arc<dyn ServicerDistribution>,
        store: Arc<dyn TalkStore>,
        config: &FileConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let ids = node_ids(&config.hub)?;
        customer_distribution
            .load()
            .await
            .context("Failed to load customer distribution")?;
        servicer_distribution
            .load()
            .await
            .context("Failed to load servicer distribution")?;

        let options = ControllerOptions::from_file(&config.controller);
        let customer = CustomerMd::new(customer_distribution);
        let customer = CustomerController::spawn(customer, options, cancel.clone());
        let servicer = ServicerMd::new(servicer_distribution);
        let servicer = ServicerController::spawn(servicer, options, cancel.clone());

        info!(
            node = config.hub.node_id,
            mode = ?config.distribution.mode,
            backend = ?config.storage.backend,
            "talk hub started"
        );
        Ok(Self {
            customer,
            servicer,
            store,
            ids,
            mailbox_capacity: config.controller.mailbox_capacity,
            cancel,
        })
    }

    pub fn customer(&self) -> &CustomerController {
        &self.customer
    }

    pub fn servicer(&self) -> &ServicerController {
        &self.servicer
    }

    pub fn store(&self) -> Arc<dyn TalkStore> {
        self.store.clone()
    }

    /// A customer session with a configured mailbox, ready to install.
    pub fn customer_session(
        &self,
        user_id: u64,
        scope: ScopeTags,
        talk_id: impl Into<String>,
        created_talk: bool,
    ) -> (Arc<CustomerSession>, mpsc::Receiver<CustomerResponse>) {
        CustomerSession::new(
            self.ids.as_ref(),
            user_id,
            scope,
            talk_id,
            created_talk,
            self.mailbox_capacity,
        )
    }

    pub fn servicer_session(
        &self,
        user_id: u64,
        scope: ScopeTags,
    ) -> (Arc<ServicerSession>, mpsc::Receiver<ServicerResponse>) {
        ServicerSession::new(self.ids.as_ref(), user_id, scope, self.mailbox_capacity)
    }

    pub fn shutdown(&self) {
        info!("talk hub shutting down");
        self.cancel.cancel();
    }
}

use async_trait::async_trait;

use crate::admin::Admin;
use crate::api::{ApiServer, ProxyBackends};
use crate::cluster::Cluster;
use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::Result;
use crate::framework::{Network, Subsystems};
use crate::producer::Producer;

/// Production subsystems: cluster-backed producer, consumer and admin
/// behind HTTP API servers.
#[derive(Clone)]
pub struct Proxy {
    cluster: Cluster,
}

impl Proxy {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Subsystems for Proxy {
    type Producer = Producer;
    type Consumer = Consumer;
    type Admin = Admin;
    type Listener = ApiServer;

    async fn spawn_producer(&self, config: &Config) -> Result<Producer> {
        Producer::spawn(config, self.cluster.broker.clone()).await
    }

    async fn spawn_consumer(&self, config: &Config) -> Result<Consumer> {
        Consumer::spawn(config, self.cluster.broker.clone(), self.cluster.coordinator.clone()).await
    }

    async fn spawn_admin(&self, config: &Config) -> Result<Admin> {
        Admin::spawn(config, self.cluster.broker.clone(), self.cluster.coordinator.clone()).await
    }

    async fn new_listener(
        &self,
        network: Network,
        addr: &str,
        config: &Config,
        backends: ProxyBackends,
    ) -> Result<ApiServer> {
        ApiServer::bind(network, addr, config, backends).await
    }
}

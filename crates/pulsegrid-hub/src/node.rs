//! One PulseGrid node: coordinator and hub wired to a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::info;

use pulse_core::{Disconnect, NodeId, NodeIdentity, PulseConfig};
use pulsegrid_cluster::{
    Broker, ClusterRegistry, ClusterResult, Coordinator, LocalNode, NodeInfoSendHandler,
    NotificationHandler, SurveyHandler, SurveyReply,
};
use pulsegrid_metrics::Observer;

use crate::client::Client;
use crate::command::Outbound;
use crate::error::HubResult;
use crate::handlers::Handlers;
use crate::hub::Hub;

pub struct Node {
    coordinator: Arc<Coordinator>,
    hub: Arc<Hub>,
    survey_timeout: Duration,
}

impl Node {
    /// Assemble a node with a fresh random ID.
    pub fn new(config: &PulseConfig, broker: Arc<dyn Broker>, observer: Arc<dyn Observer>) -> HubResult<Self> {
        let identity = NodeIdentity::new(&config.node.name, &config.node.version);
        Self::with_identity(identity, config, broker, observer)
    }

    pub fn with_identity(
        identity: NodeIdentity,
        config: &PulseConfig,
        broker: Arc<dyn Broker>,
        observer: Arc<dyn Observer>,
    ) -> HubResult<Self> {
        config.validate()?;
        let registry = Arc::new(ClusterRegistry::new(&identity.id));
        let coordinator = Arc::new(
            Coordinator::new(identity, Arc::clone(&broker), registry, Arc::clone(&observer))
                .with_control_topic(&config.cluster.control_topic)
                .with_heartbeat_interval(config.heartbeat_interval()?)
                .with_node_ttl(config.node_ttl()?),
        );
        let hub = Hub::new(Arc::clone(&coordinator), broker, observer, config);
        let local: Arc<dyn LocalNode> = hub.clone();
        coordinator.set_local(&local);

        Ok(Self {
            coordinator,
            hub,
            survey_timeout: config.survey_timeout()?,
        })
    }

    /// Attach to the broker. Call once before accepting connections.
    pub fn start(&self) -> HubResult<()> {
        self.coordinator.start()?;
        info!(node_id = %self.node_id(), "node started");
        Ok(())
    }

    /// Run the heartbeat loop until `shutdown` fires, then close every
    /// connection and leave the cluster.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(Arc::clone(&self.coordinator).run(stop_rx));

        let _ = shutdown.changed().await;
        self.hub.close_all(Disconnect::shutdown());
        let _ = stop_tx.send(true);
        let _ = heartbeat.await;
        info!(node_id = %self.node_id(), "node stopped");
    }

    /// Close every connection and leave the cluster without running the
    /// heartbeat loop.
    pub fn shutdown(&self) {
        self.hub.close_all(Disconnect::shutdown());
        self.coordinator.leave();
    }

    pub fn node_id(&self) -> &str {
        self.coordinator.node_id()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        self.coordinator.registry()
    }

    pub fn set_handlers(&self, handlers: Handlers) {
        self.hub.set_handlers(handlers);
    }

    pub fn connect(&self, tx: mpsc::UnboundedSender<Outbound>) -> Arc<Client> {
        self.hub.connect(tx)
    }

    /// Survey every node with the configured timeout.
    pub async fn survey(&self, op: &str, data: Vec<u8>) -> ClusterResult<HashMap<NodeId, SurveyReply>> {
        self.coordinator.survey(op, data, self.survey_timeout).await
    }

    pub fn notify(&self, op: &str, data: Vec<u8>) -> ClusterResult<()> {
        self.coordinator.notify(op, data)
    }

    pub fn on_survey(&self, handler: SurveyHandler) {
        self.coordinator.on_survey(handler);
    }

    pub fn on_notification(&self, handler: NotificationHandler) {
        self.coordinator.on_notification(handler);
    }

    pub fn on_node_info_send(&self, handler: NodeInfoSendHandler) {
        self.coordinator.on_node_info_send(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsegrid_cluster::MemoryBus;
    use pulsegrid_metrics::NoopObserver;

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PulseConfig::default();
        config.cluster.node_ttl = "1s".into();
        let bus = MemoryBus::new();
        let result = Node::new(&config, Arc::new(bus.broker()), Arc::new(NoopObserver));
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_closes_clients_and_leaves() {
        let bus = MemoryBus::new();
        let node = Node::new(&PulseConfig::default(), Arc::new(bus.broker()), Arc::new(NoopObserver)).unwrap();
        node.start().unwrap();
        let control = node.coordinator().control_topic().to_string();
        assert_eq!(bus.subscriber_count(&control), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = node.connect(tx);
        client
            .dispatch(crate::command::Command::new(
                1,
                crate::command::Request::Connect {
                    token: String::new(),
                    data: vec![],
                    name: "t".into(),
                    version: "1".into(),
                    channels: vec![],
                },
            ))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Outbound::Reply(_))));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = Arc::new(node);
        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Disconnect(Disconnect::shutdown())));
        assert_eq!(node.hub().num_clients(), 0);
        assert_eq!(bus.subscriber_count(&control), 0);
    }
}

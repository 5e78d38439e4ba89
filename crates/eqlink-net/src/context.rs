//! Application-owned connection handles.
//!
//! A game client talks to two endpoints over its lifetime: the world server
//! (login, character select) and the zone server it is currently in.
//! [`ClientContext`] owns one [`ConnectionManager`] for each; pass it (or
//! clones of the managers) to whatever needs the network.

use crate::connection::{ConnectionManager, ManagerConfig};
use crate::transport::{Connector, NetConnector, NetConnectorConfig};

/// World and zone connections for one client.
pub struct ClientContext<C: Connector = NetConnector> {
    world: ConnectionManager<C>,
    zone: ConnectionManager<C>,
}

impl ClientContext<NetConnector> {
    /// Build both managers over TCP + UDP.
    pub fn new(connector: NetConnectorConfig, config: ManagerConfig) -> Self {
        Self::with_connector(NetConnector::new(connector), config)
    }
}

impl<C: Connector + Clone> ClientContext<C> {
    /// Build both managers over `connector`.
    pub fn with_connector(connector: C, config: ManagerConfig) -> Self {
        Self {
            world: ConnectionManager::new(connector.clone(), config.clone()),
            zone: ConnectionManager::new(connector, config),
        }
    }
}

impl<C: Connector> ClientContext<C> {
    /// The world server connection.
    pub fn world(&self) -> &ConnectionManager<C> {
        &self.world
    }

    /// The zone server connection.
    pub fn zone(&self) -> &ConnectionManager<C> {
        &self.zone
    }

    /// Close both connections without reconnecting.
    pub fn close_all(&self) {
        self.world.close(false);
        self.zone.close(false);
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rtc_tunnel::engine::memory::MemoryNetwork;
use rtc_tunnel::signal::{BusSignalTransport, SignalInitiator, SignalResponder};
use rtc_tunnel::{Connection, ConnectionListener, TunnelConfig};
use signal_bus::LocalBus;

pub const SERVER_ID: &str = "server";

pub fn config() -> TunnelConfig {
    TunnelConfig::localhost().with_poll_interval(Duration::from_millis(20))
}

/// Both ends of a signaling setup over one in-memory bus and network.
pub struct Rig {
    pub network: MemoryNetwork,
    pub bus: LocalBus,
    pub listener: ConnectionListener,
    pub config: TunnelConfig,
}

impl Rig {
    pub async fn start(config: TunnelConfig) -> Self {
        let network = MemoryNetwork::new();
        let bus = LocalBus::new();
        let responder = SignalResponder::new(
            SERVER_ID,
            Arc::new(BusSignalTransport::new(Arc::new(bus.endpoint()))),
        );
        let listener = rtc_tunnel::listen(responder, Arc::new(network.clone()), config.clone())
            .await
            .expect("listen");
        Self {
            network,
            bus,
            listener,
            config,
        }
    }

    pub fn initiator(&self, id: &str) -> SignalInitiator {
        SignalInitiator::new(
            id,
            Arc::new(BusSignalTransport::new(Arc::new(self.bus.endpoint()))),
        )
    }

    pub async fn dial(&self, id: &str) -> Result<Connection, rtc_tunnel::ConnectError> {
        rtc_tunnel::connect(self.initiator(id), SERVER_ID, &self.network, &self.config).await
    }
}

pub struct Tunnel {
    pub rig: Rig,
    pub client: Connection,
    pub server: Connection,
}

pub async fn tunnel() -> Tunnel {
    tunnel_with(config()).await
}

pub async fn tunnel_with(config: TunnelConfig) -> Tunnel {
    let mut rig = Rig::start(config).await;
    let client = rig.dial("client").await.expect("connect");
    let server = rig.listener.accept().await.expect("accepted connection");
    Tunnel {
        rig,
        client,
        server,
    }
}

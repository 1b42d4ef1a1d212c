//! Network manager: the top-level coordinator of the P2P fabric.
//!
//! Starts discovery and the accept loop, owns the peer table, and routes
//! decoded frames to the sync and transfer subsystems. Without a bound
//! database or cache directory the manager still runs discovery-only.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::events::{EventBus, NetworkEvent};
use crate::net::discovery::{DiscoveryEvent, LanDiscovery};
use crate::net::pairing::FamilyPairing;
use crate::net::peer::{PeerConnection, PeerHandle, PeerHandler};
use crate::net::sync::IndexSyncManager;
use crate::net::transfer::{FileResolver, RemoteFileAccess, RequestOutcome};
use crate::net::transport::{self, codec};
use crate::types::{now_ts, NetworkState};

/// Seconds an address stays blocked after a failed handshake.
const HANDSHAKE_BLOCK_SECS: i64 = 1;

struct Shared {
    identity: DeviceIdentity,
    state: RwLock<NetworkState>,
    peers: tokio::sync::RwLock<HashMap<String, Arc<PeerConnection>>>,
    sync: Mutex<Option<Arc<IndexSyncManager>>>,
    transfer: Mutex<Option<Arc<RemoteFileAccess>>>,
    events: Arc<EventBus>,
    discovery: Arc<LanDiscovery>,
    last_error: Mutex<Option<Error>>,
}

impl Shared {
    fn set_state(&self, state: NetworkState) {
        *self.state.write().unwrap() = state;
        self.events.emit(NetworkEvent::StateChanged { state });
    }

    fn record_error(&self, error: Error) {
        self.events.emit(NetworkEvent::Error {
            message: error.to_string(),
        });
        *self.last_error.lock().unwrap() = Some(error);
    }
}

pub struct NetworkManager {
    ports: PortConfig,
    pairing: Arc<FamilyPairing>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound_port: Mutex<Option<u16>>,
}

impl NetworkManager {
    pub fn new(
        identity: DeviceIdentity,
        ports: PortConfig,
        pairing: Arc<FamilyPairing>,
        events: Arc<EventBus>,
    ) -> Self {
        let discovery = Arc::new(LanDiscovery::new(
            identity.clone(),
            ports.service_port,
            ports.discovery_port,
        ));
        let shared = Arc::new(Shared {
            identity,
            state: RwLock::new(NetworkState::Stopped),
            peers: tokio::sync::RwLock::new(HashMap::new()),
            sync: Mutex::new(None),
            transfer: Mutex::new(None),
            events,
            discovery,
            last_error: Mutex::new(None),
        });
        let dispatcher = Arc::new(Dispatcher {
            shared: shared.clone(),
        });
        Self {
            ports,
            pairing,
            shared,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
            bound_port: Mutex::new(None),
        }
    }

    /// Enable index sync, wiring its progress into the event bus.
    pub fn bind_database(&self, db: Arc<crate::db::Database>) {
        let sync = Arc::new(IndexSyncManager::new(
            db,
            self.shared.identity.device_id.clone(),
        ));
        let events = self.shared.events.clone();
        sync.set_progress_callback(Arc::new(move |progress| {
            events.emit(NetworkEvent::SyncProgress(progress));
        }));
        let events = self.shared.events.clone();
        sync.set_complete_callback(Arc::new(move |summary| {
            events.emit(NetworkEvent::SyncComplete(summary));
        }));
        *self.shared.sync.lock().unwrap() = Some(sync);
    }

    /// Enable remote file access, wiring transfer callbacks into the bus.
    pub fn bind_cache(&self, cache_dir: PathBuf, resolver: Arc<dyn FileResolver>) {
        let transfer = Arc::new(RemoteFileAccess::new(cache_dir, resolver));
        let events = self.shared.events.clone();
        transfer.set_progress_callback(Arc::new(move |progress| {
            events.emit(NetworkEvent::FileTransferProgress(progress));
        }));
        let events = self.shared.events.clone();
        transfer.set_complete_callback(Arc::new(move |progress| {
            events.emit(NetworkEvent::FileTransferComplete(progress));
        }));
        let events = self.shared.events.clone();
        transfer.set_error_callback(Arc::new(move |progress| {
            events.emit(NetworkEvent::FileTransferError(progress));
        }));
        *self.shared.transfer.lock().unwrap() = Some(transfer);
    }

    pub fn state(&self) -> NetworkState {
        *self.shared.state.read().unwrap()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Port the accept loop actually bound (after `start`).
    pub fn service_port(&self) -> Option<u16> {
        *self.bound_port.lock().unwrap()
    }

    pub fn sync_manager(&self) -> Option<Arc<IndexSyncManager>> {
        self.shared.sync.lock().unwrap().clone()
    }

    pub fn file_access(&self) -> Option<Arc<RemoteFileAccess>> {
        self.shared.transfer.lock().unwrap().clone()
    }

    /// Start discovery and (when paired) the secure accept loop.
    pub async fn start(&self, port: Option<u16>) -> Result<()> {
        if self.state() != NetworkState::Stopped && self.state() != NetworkState::Error {
            return Err(Error::Busy("network already running".into()));
        }
        self.shared.set_state(NetworkState::Starting);

        let result = self.start_inner(port).await;
        match result {
            Ok(()) => {
                self.shared.set_state(NetworkState::Running);
                Ok(())
            }
            Err(e) => {
                self.shared.record_error(e.clone());
                self.shared.set_state(NetworkState::Error);
                Err(e)
            }
        }
    }

    async fn start_inner(&self, port: Option<u16>) -> Result<()> {
        // Discovery events pump.
        let (discovery_tx, mut discovery_rx) = tokio::sync::mpsc::unbounded_channel();
        self.shared.discovery.start(discovery_tx)?;
        let events = self.shared.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = discovery_rx.recv().await {
                match event {
                    DiscoveryEvent::Found(device) => {
                        events.emit(NetworkEvent::DeviceDiscovered(device))
                    }
                    DiscoveryEvent::Updated(device) => {
                        events.emit(NetworkEvent::DeviceDiscovered(device))
                    }
                    DiscoveryEvent::Lost(device_id) => {
                        events.emit(NetworkEvent::DeviceLost { device_id })
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(pump);

        // The secure transport needs the PSK, which needs a paired device.
        if !self.pairing.is_configured().await? {
            info!("device not paired yet, running discovery-only");
            return Ok(());
        }
        let psk = self.pairing.psk().await?;

        let service_port = port.unwrap_or(self.ports.service_port);
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, service_port))
            .await
            .map_err(|e| Error::Network(format!("bind {service_port}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?
            .port();
        *self.bound_port.lock().unwrap() = Some(bound);

        let shared = self.shared.clone();
        let dispatcher = self.dispatcher.clone();
        let accept = tokio::spawn(async move {
            accept_loop(listener, shared, dispatcher, psk).await;
        });
        self.tasks.lock().unwrap().push(accept);

        info!(port = bound, "network manager started");
        Ok(())
    }

    pub async fn stop(&self) {
        if self.state() == NetworkState::Stopped {
            return;
        }
        self.shared.set_state(NetworkState::Stopping);
        self.disconnect_all().await;
        self.shared.discovery.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.bound_port.lock().unwrap() = None;
        self.shared.set_state(NetworkState::Stopped);
    }

    // ---- connections -----------------------------------------------------

    pub fn discovered_devices(&self) -> Vec<crate::net::discovery::DiscoveredDevice> {
        self.shared.discovery.devices()
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        self.shared.peers.read().await.keys().cloned().collect()
    }

    pub async fn peer(&self, device_id: &str) -> Option<PeerHandle> {
        self.shared
            .peers
            .read()
            .await
            .get(device_id)
            .map(|p| p.handle.clone())
    }

    /// Connect to a device previously seen by discovery.
    pub async fn connect_to_device(&self, device_id: &str) -> Result<PeerHandle> {
        let device = self
            .shared
            .discovery
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id} not discovered")))?;
        self.connect_to_address(SocketAddr::new(device.ip, device.service_port))
            .await
    }

    /// Connect to an explicit address.
    pub async fn connect_to_address(&self, addr: SocketAddr) -> Result<PeerHandle> {
        if self.state() != NetworkState::Running {
            return Err(Error::Network("network is not running".into()));
        }
        let psk = self.pairing.psk().await?;
        let dispatcher: Arc<dyn PeerHandler> = self.dispatcher.clone();
        let connection =
            PeerConnection::connect(addr, &self.shared.identity, &psk, dispatcher).await?;
        let handle = connection.handle.clone();

        {
            let mut peers = self.shared.peers.write().await;
            if let Some(existing) = peers.get(&handle.device_id) {
                // Keep the first healthy connection; drop the duplicate.
                if existing.state() == crate::net::peer::PeerState::Connected {
                    connection.abort();
                    return Ok(existing.handle.clone());
                }
            }
            peers.insert(handle.device_id.clone(), connection);
        }
        self.shared.discovery.set_connected(&handle.device_id, true);
        self.shared.events.emit(NetworkEvent::DeviceConnected {
            device_id: handle.device_id.clone(),
        });
        Ok(handle)
    }

    pub async fn disconnect_device(&self, device_id: &str) -> Result<()> {
        let connection = self.shared.peers.write().await.remove(device_id);
        match connection {
            Some(connection) => {
                connection.disconnect().await;
                self.shared.discovery.set_connected(device_id, false);
                self.shared.events.emit(NetworkEvent::DeviceDisconnected {
                    device_id: device_id.to_string(),
                });
                Ok(())
            }
            None => Err(Error::NotFound(format!("peer {device_id}"))),
        }
    }

    pub async fn disconnect_all(&self) {
        let peers: Vec<(String, Arc<PeerConnection>)> =
            self.shared.peers.write().await.drain().collect();
        for (device_id, peer) in peers {
            peer.disconnect().await;
            self.shared.discovery.set_connected(&device_id, false);
            self.shared.events.emit(NetworkEvent::DeviceDisconnected { device_id });
        }
    }

    // ---- high-level operations -------------------------------------------

    /// Start an index sync with a connected peer.
    pub async fn sync_with_device(&self, device_id: &str) -> Result<()> {
        let sync = self
            .sync_manager()
            .ok_or_else(|| Error::Internal("no database bound".into()))?;
        let peer = self
            .peer(device_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("peer {device_id}")))?;
        sync.sync_with(&peer).await
    }

    /// Request a remote file; returns the cached path or a pending id.
    pub async fn request_file(
        &self,
        device_id: &str,
        file_id: i64,
        expected_size: Option<i64>,
        checksum: Option<String>,
    ) -> Result<RequestOutcome> {
        let transfer = self
            .file_access()
            .ok_or_else(|| Error::Internal("no cache directory bound".into()))?;
        let peer = self
            .peer(device_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("peer {device_id}")))?;
        transfer.request_file(&peer, file_id, expected_size, checksum).await
    }
}

/// Accept inbound peers, with a short per-address block after handshake
/// failures (a wrong PSK shows up here as `AuthFailed`).
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    psk: [u8; 32],
) {
    let mut blocked: HashMap<IpAddr, i64> = HashMap::new();
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                shared.record_error(Error::Network(format!("accept: {e}")));
                continue;
            }
        };
        if blocked
            .get(&addr.ip())
            .is_some_and(|&until| until > now_ts())
        {
            debug!(%addr, "dropping connection from blocked address");
            continue;
        }

        match transport::accept(stream, &shared.identity, &psk).await {
            Ok(secure) => {
                let handler: Arc<dyn PeerHandler> = dispatcher.clone();
                let connection = PeerConnection::accept(secure, addr, handler);
                let device_id = connection.handle.device_id.clone();
                shared.peers.write().await.insert(device_id.clone(), connection);
                shared.discovery.set_connected(&device_id, true);
                shared
                    .events
                    .emit(NetworkEvent::DeviceConnected { device_id });
            }
            Err(e) => {
                // Security event: somebody on the LAN without our PSK.
                warn!(peer_ip = %addr.ip(), error = %e, "handshake rejected");
                blocked.insert(addr.ip(), now_ts() + HANDSHAKE_BLOCK_SECS);
            }
        }
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
}

#[async_trait]
impl PeerHandler for Dispatcher {
    async fn on_frame(&self, peer: &PeerHandle, frame: codec::Frame) {
        match frame {
            codec::Frame::Message(message) => self.route_message(peer, message).await,
            codec::Frame::Chunk(chunk) => {
                let transfer = self.shared.transfer.lock().unwrap().clone();
                match transfer {
                    Some(transfer) => transfer.handle_chunk(peer, chunk).await,
                    None => debug!("chunk frame without bound cache, dropping"),
                }
            }
        }
    }

    async fn on_disconnected(&self, device_id: &str, reason: Option<String>) {
        let connection = self.shared.peers.write().await.remove(device_id);
        self.shared.discovery.set_connected(device_id, false);
        let transfer = self.shared.transfer.lock().unwrap().clone();
        if let Some(transfer) = transfer {
            transfer.cancel_all_requests(device_id).await;
        }
        if let Some(reason) = reason {
            self.shared.record_error(Error::Network(format!(
                "peer {device_id} dropped: {reason}"
            )));
        }
        self.shared.events.emit(NetworkEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
        // Last: this may abort the very task running the callback.
        if let Some(connection) = connection {
            connection.abort();
        }
    }
}

impl Dispatcher {
    async fn route_message(&self, peer: &PeerHandle, message: codec::WireMessage) {
        use codec::MessageType::*;
        let sync = self.shared.sync.lock().unwrap().clone();
        let transfer = self.shared.transfer.lock().unwrap().clone();

        let result: Result<()> = match message.kind() {
            Some(IndexSyncRequest) => match &sync {
                Some(sync) => sync.handle_request(peer, &message).await,
                None => {
                    debug!("sync request without bound database, dropping");
                    Ok(())
                }
            },
            Some(IndexSyncResponse) => match &sync {
                Some(sync) => sync.handle_response(peer, &message).await,
                None => Ok(()),
            },
            Some(IndexDelta) => match &sync {
                Some(sync) => sync.handle_delta(peer, &message).await,
                None => Ok(()),
            },
            Some(IndexDeltaAck) => Ok(()),
            Some(
                FileRequest | FileMetadata | FileChunkAck | FileComplete | FileError
                | ThumbnailRequest | ThumbnailResponse,
            ) => match &transfer {
                Some(transfer) => {
                    transfer.clone().handle_message(peer, &message).await;
                    Ok(())
                }
                None => {
                    debug!("file message without bound cache, dropping");
                    Ok(())
                }
            },
            Some(DeviceInfo) => {
                let reply = codec::WireMessage::json_reply(
                    DeviceInfoAck,
                    message.request_id.clone(),
                    &self.shared.identity,
                );
                match reply {
                    Ok(reply) => peer.send_message(&reply).await,
                    Err(e) => Err(e),
                }
            }
            Some(DeviceInfoAck | Heartbeat | HeartbeatAck | Disconnect | Error) => Ok(()),
            None => {
                warn!(msg_type = message.msg_type, "unknown message type, dropping");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(peer = %peer.device_id, error = %e, "message handling failed");
            self.shared.record_error(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;
    use crate::vault::SecretVault;

    async fn manager() -> NetworkManager {
        let vault = Arc::new(SecretVault::in_memory());
        vault.init().await.unwrap();
        let identity = DeviceIdentity {
            device_id: "m1".into(),
            device_name: "m1".into(),
            device_type: DeviceType::Desktop,
        };
        let mut ports = PortConfig::default();
        // Ephemeral everything so tests never collide.
        ports.discovery_port = 0;
        NetworkManager::new(
            identity,
            ports,
            Arc::new(FamilyPairing::new(vault)),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn lifecycle_discovery_only() {
        let manager = manager().await;
        assert_eq!(manager.state(), NetworkState::Stopped);

        manager.start(None).await.unwrap();
        assert_eq!(manager.state(), NetworkState::Running);
        // Unpaired: no service port bound.
        assert!(manager.service_port().is_none());

        // Starting twice is refused.
        assert!(manager.start(None).await.is_err());

        manager.stop().await;
        assert_eq!(manager.state(), NetworkState::Stopped);
    }

    #[tokio::test]
    async fn state_changes_are_emitted() {
        let manager = manager().await;
        let mut rx = manager.shared.events.subscribe();
        manager.start(None).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let NetworkEvent::StateChanged { state } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec![NetworkState::Starting, NetworkState::Running]);
        manager.stop().await;
    }

    #[tokio::test]
    async fn operations_require_bound_collaborators() {
        let manager = manager().await;
        manager.start(None).await.unwrap();
        assert!(manager.sync_with_device("nobody").await.is_err());
        assert!(manager
            .request_file("nobody", 1, None, None)
            .await
            .is_err());
        manager.stop().await;
    }
}

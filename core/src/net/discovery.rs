//! UDP LAN discovery.
//!
//! An announcer broadcasts a small JSON datagram every five seconds to every
//! local IPv4 broadcast address; a listener folds received datagrams into a
//! device map; a sweeper flips devices offline after fifteen silent seconds.
//! Discovery packets carry identity only, never secrets or index data.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use if_watch::tokio::IfWatcher;
use if_watch::{IfEvent, IpNet};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::net::transport::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::types::{now_ts, DeviceType};

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
pub const OFFLINE_AFTER_SECS: i64 = 15;
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;
const APP_NAME: &str = "FamilyVault";

/// The broadcast datagram. Plain JSON, camelCase keys, no secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAnnouncement {
    pub app: String,
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub service_port: u16,
}

/// A peer seen on the LAN.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip: IpAddr,
    pub service_port: u16,
    pub last_seen_at: i64,
    pub is_online: bool,
    pub is_connected: bool,
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Found(DiscoveredDevice),
    Updated(DiscoveredDevice),
    Lost(String),
}

pub struct LanDiscovery {
    identity: DeviceIdentity,
    service_port: u16,
    discovery_port: u16,
    devices: Arc<RwLock<HashMap<String, DiscoveredDevice>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LanDiscovery {
    pub fn new(identity: DeviceIdentity, service_port: u16, discovery_port: u16) -> Self {
        Self {
            identity,
            service_port,
            discovery_port,
            devices: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start announcer, listener and sweeper tasks. Discovery events land on
    /// `events`.
    pub fn start(&self, events: mpsc::UnboundedSender<DiscoveryEvent>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy("discovery already running".into()));
        }
        *self.events.lock().unwrap() = Some(events);

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(announcer_loop(
            self.announcement(),
            self.discovery_port,
            self.running.clone(),
        )));
        tasks.push(tokio::spawn(listener_loop(
            self.identity.device_id.clone(),
            self.discovery_port,
            self.devices.clone(),
            self.events.clone(),
            self.running.clone(),
        )));
        tasks.push(tokio::spawn(sweeper_loop(
            self.devices.clone(),
            self.events.clone(),
            self.running.clone(),
        )));
        info!(port = self.discovery_port, "lan discovery started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        *self.events.lock().unwrap() = None;
        info!("lan discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, device_id: &str) -> Option<DiscoveredDevice> {
        self.devices.read().unwrap().get(device_id).cloned()
    }

    /// Flag a device as connected/disconnected at the transport level.
    pub fn set_connected(&self, device_id: &str, connected: bool) {
        if let Some(device) = self.devices.write().unwrap().get_mut(device_id) {
            device.is_connected = connected;
        }
    }

    fn announcement(&self) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            app: APP_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            device_type: self.identity.device_type,
            service_port: self.service_port,
        }
    }

    /// Fold one received datagram into the device map (listener internals,
    /// split out for tests).
    pub(crate) fn apply_datagram(
        local_device_id: &str,
        devices: &RwLock<HashMap<String, DiscoveredDevice>>,
        events: &Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>,
        raw: &[u8],
        from: IpAddr,
    ) {
        let Ok(announcement) = serde_json::from_slice::<DiscoveryAnnouncement>(raw) else {
            debug!(%from, "ignoring malformed discovery datagram");
            return;
        };
        if announcement.app != APP_NAME || announcement.device_id == local_device_id {
            return;
        }
        // Version gate: the pair would speak min(vA, vB); both floors must
        // allow it, otherwise the peer is invisible.
        let negotiated = PROTOCOL_VERSION.min(announcement.protocol_version);
        if negotiated < MIN_PROTOCOL_VERSION || negotiated < announcement.min_protocol_version {
            debug!(
                peer = %announcement.device_id,
                version = announcement.protocol_version,
                "ignoring protocol-incompatible peer"
            );
            return;
        }

        let mut devices = devices.write().unwrap();
        let event = match devices.get_mut(&announcement.device_id) {
            Some(known) => {
                known.device_name = announcement.device_name.clone();
                known.device_type = announcement.device_type;
                known.ip = from;
                known.service_port = announcement.service_port;
                known.last_seen_at = now_ts();
                let came_back = !known.is_online;
                known.is_online = true;
                if came_back {
                    DiscoveryEvent::Found(known.clone())
                } else {
                    DiscoveryEvent::Updated(known.clone())
                }
            }
            None => {
                let device = DiscoveredDevice {
                    device_id: announcement.device_id.clone(),
                    device_name: announcement.device_name,
                    device_type: announcement.device_type,
                    ip: from,
                    service_port: announcement.service_port,
                    last_seen_at: now_ts(),
                    is_online: true,
                    is_connected: false,
                };
                devices.insert(announcement.device_id.clone(), device.clone());
                DiscoveryEvent::Found(device)
            }
        };
        drop(devices);
        emit(events, event);
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emit(
    events: &Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>,
    event: DiscoveryEvent,
) {
    if let Some(tx) = events.lock().unwrap().as_ref() {
        let _ = tx.send(event);
    }
}

/// Broadcast the announcement every five seconds to every interface
/// broadcast address (tracked live) plus the limited broadcast address.
/// Socket failures restart the loop after a back-off.
async fn announcer_loop(
    announcement: DiscoveryAnnouncement,
    discovery_port: u16,
    running: Arc<AtomicBool>,
) {
    let payload = match serde_json::to_vec(&announcement) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "announcement serialization failed");
            return;
        }
    };

    let mut backoff = Duration::from_secs(1);
    while running.load(Ordering::SeqCst) {
        match announcer_once(&payload, discovery_port, &running).await {
            Ok(()) => return,
            Err(e) => {
                warn!(error = %e, backoff = ?backoff, "announcer restarting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}

async fn announcer_once(
    payload: &[u8],
    discovery_port: u16,
    running: &AtomicBool,
) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let mut watcher = IfWatcher::new().map_err(|e| Error::Network(format!("if-watch: {e}")))?;
    let mut broadcast_addrs: HashSet<Ipv4Addr> = HashSet::new();
    let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);

    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::select! {
            event = watcher.next() => {
                match event {
                    Some(Ok(IfEvent::Up(IpNet::V4(net)))) => {
                        if !net.addr().is_loopback() {
                            broadcast_addrs.insert(net.broadcast());
                        }
                    }
                    Some(Ok(IfEvent::Down(IpNet::V4(net)))) => {
                        broadcast_addrs.remove(&net.broadcast());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(Error::Network(format!("interface watch: {e}")))
                    }
                    None => return Err(Error::Network("interface watch ended".into())),
                }
            }
            _ = interval.tick() => {
                let mut targets: Vec<Ipv4Addr> = broadcast_addrs.iter().copied().collect();
                targets.push(Ipv4Addr::BROADCAST);
                for target in targets {
                    let addr = SocketAddr::from((target, discovery_port));
                    if let Err(e) = socket.send_to(payload, addr).await {
                        // Individual interface errors are routine (e.g. a VPN
                        // interface without broadcast); a socket-level failure
                        // escalates to a restart.
                        if e.kind() == std::io::ErrorKind::NotConnected {
                            return Err(e.into());
                        }
                        debug!(%addr, error = %e, "broadcast send failed");
                    }
                }
            }
        }
    }
}

async fn listener_loop(
    local_device_id: String,
    discovery_port: u16,
    devices: Arc<RwLock<HashMap<String, DiscoveredDevice>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>>,
    running: Arc<AtomicBool>,
) {
    let mut backoff = Duration::from_secs(1);
    while running.load(Ordering::SeqCst) {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, backoff = ?backoff, "discovery bind failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
                continue;
            }
        };
        backoff = Duration::from_secs(1);

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    LanDiscovery::apply_datagram(
                        &local_device_id,
                        &devices,
                        &events,
                        &buf[..len],
                        from.ip(),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "discovery receive failed, rebinding");
                    break;
                }
            }
        }
    }
}

async fn sweeper_loop(
    devices: Arc<RwLock<HashMap<String, DiscoveredDevice>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<DiscoveryEvent>>>>,
    running: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    while running.load(Ordering::SeqCst) {
        interval.tick().await;
        let cutoff = now_ts() - OFFLINE_AFTER_SECS;
        let mut lost = Vec::new();
        {
            let mut devices = devices.write().unwrap();
            for device in devices.values_mut() {
                if device.is_online && device.last_seen_at < cutoff {
                    device.is_online = false;
                    lost.push(device.device_id.clone());
                }
            }
        }
        for device_id in lost {
            emit(&events, DiscoveryEvent::Lost(device_id));
        }
    }
}

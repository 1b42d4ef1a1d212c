//! Event bus carrying network events up to the UI layer.
//!
//! Event codes are part of the external ABI and are frozen; payloads are
//! serialized to JSON at the boundary so asynchronous consumers never borrow
//! core memory.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::net::discovery::DiscoveredDevice;
use crate::net::sync::{SyncProgress, SyncSummary};
use crate::net::transfer::TransferProgress;
use crate::types::NetworkState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NetworkEvent {
    DeviceDiscovered(DiscoveredDevice),
    DeviceLost { device_id: String },
    DeviceConnected { device_id: String },
    DeviceDisconnected { device_id: String },
    StateChanged { state: NetworkState },
    Error { message: String },
    SyncProgress(SyncProgress),
    SyncComplete(SyncSummary),
    FileTransferProgress(TransferProgress),
    FileTransferComplete(TransferProgress),
    FileTransferError(TransferProgress),
}

impl NetworkEvent {
    /// Stable numeric code for the FFI boundary.
    pub fn code(&self) -> i32 {
        match self {
            NetworkEvent::DeviceDiscovered(_) => 0,
            NetworkEvent::DeviceLost { .. } => 1,
            NetworkEvent::DeviceConnected { .. } => 2,
            NetworkEvent::DeviceDisconnected { .. } => 3,
            NetworkEvent::StateChanged { .. } => 4,
            NetworkEvent::Error { .. } => 5,
            NetworkEvent::SyncProgress(_) => 6,
            NetworkEvent::SyncComplete(_) => 7,
            NetworkEvent::FileTransferProgress(_) => 8,
            NetworkEvent::FileTransferComplete(_) => 9,
            NetworkEvent::FileTransferError(_) => 10,
        }
    }

    /// Independently owned JSON payload for async consumers.
    pub fn payload_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Broadcast bus; emitting never blocks and never fails, even without
/// subscribers.
pub struct EventBus {
    sender: broadcast::Sender<NetworkEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: NetworkEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            NetworkEvent::DeviceLost {
                device_id: "d".into()
            }
            .code(),
            1
        );
        assert_eq!(
            NetworkEvent::StateChanged {
                state: NetworkState::Running
            }
            .code(),
            4
        );
        assert_eq!(
            NetworkEvent::Error {
                message: "m".into()
            }
            .code(),
            5
        );
    }

    #[tokio::test]
    async fn subscribers_see_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(NetworkEvent::DeviceConnected {
            device_id: "peer".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.code(), 2);
        assert!(event.payload_json().contains("peer"));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(NetworkEvent::Error {
            message: "nobody listening".into(),
        });
    }
}

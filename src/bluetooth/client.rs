/// BlueZ-backed transport for talking to a Progressor over GATT
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, Device, Uuid};
use futures_util::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};

use crate::bluetooth::transport::Transport;
use crate::error::TransportError;
use crate::models::Peripheral;
use crate::protocol::codec::PROGRESSOR_SERVICE_UUID;

const NOTIFICATION_QUEUE: usize = 256; // notifications buffered ahead of the controller

/// Linux Bluetooth adapter driven through bluetoothd
pub struct BluerTransport {
    // Dropping the session tears down the D-Bus connection
    _session: bluer::Session,
    adapter: Adapter,
}

/// An open link to the device with its Progressor characteristics resolved
pub struct BluerConnection {
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarders: Vec<JoinHandle<()>>,
}

impl BluerTransport {
    pub async fn new() -> Result<Self, TransportError> {
        // Initialize Bluetooth session
        let session = bluer::Session::new().await.map_err(|e| {
            error!("Failed to create Bluetooth session: {}", e);
            TransportError::Adapter(e.to_string())
        })?;

        // Get the default Bluetooth adapter
        let adapter = session.default_adapter().await.map_err(|e| {
            error!("Failed to get default Bluetooth adapter: {}", e);
            TransportError::Adapter(e.to_string())
        })?;

        // Ensure Bluetooth adapter is powered on
        adapter.set_powered(true).await.map_err(|e| {
            error!("Failed to power on adapter: {}", e);
            TransportError::Adapter(e.to_string())
        })?;

        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluerTransport {
            _session: session,
            adapter,
        })
    }
}

impl BluerConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
    }
}

impl Transport for BluerTransport {
    type Connection = BluerConnection;

    async fn scan(&mut self, timeout: Duration) -> Result<Vec<Peripheral>, TransportError> {
        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;
        pin_mut!(events);

        // Discovery stops when the stream is dropped at the end of the scan
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
            debug!("Discovery event: {:?}", event);
            let AdapterEvent::DeviceAdded(addr) = event else {
                continue;
            };
            if seen.iter().any(|p: &Peripheral| p.address == addr.to_string()) {
                continue;
            }

            let device = match self.adapter.device(addr) {
                Ok(device) => device,
                Err(_) => continue,
            };
            let name = device.name().await.unwrap_or_else(|e| {
                debug!("Failed to read name of {}: {}", addr, e);
                None
            });

            seen.push(Peripheral {
                name,
                address: addr.to_string(),
            });
        }

        Ok(seen)
    }

    async fn connect(&mut self, address: &str) -> Result<Self::Connection, TransportError> {
        let addr: Address = address
            .parse()
            .map_err(|_| TransportError::Connection(format!("invalid address {}", address)))?;

        let device = self
            .adapter
            .device(addr)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }

        let mut characteristics = HashMap::new();
        let services = device
            .services()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        for service in services {
            match service.uuid().await {
                Ok(uuid) if uuid == PROGRESSOR_SERVICE_UUID => {}
                _ => continue,
            }

            let chars = service
                .characteristics()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            for characteristic in chars {
                if let Ok(uuid) = characteristic.uuid().await {
                    debug!("Found characteristic {}", uuid);
                    characteristics.insert(uuid, characteristic);
                }
            }
        }

        if characteristics.is_empty() {
            let _ = device.disconnect().await;
            return Err(TransportError::Connection(format!(
                "service {} not found on {}",
                PROGRESSOR_SERVICE_UUID, address
            )));
        }

        Ok(BluerConnection {
            device,
            characteristics,
            forwarders: Vec::new(),
        })
    }

    async fn subscribe(
        &mut self,
        connection: &mut Self::Connection,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let characteristic = connection.characteristic(characteristic)?.clone();
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        // Forward notifications until the link drops or the receiver goes away
        let forwarder = tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        });
        connection.forwarders.push(forwarder);

        ready_rx
            .await
            .map_err(|_| TransportError::Subscribe("notification task stopped".to_string()))?
            .map_err(TransportError::Subscribe)?;

        Ok(rx)
    }

    async fn write(
        &mut self,
        connection: &mut Self::Connection,
        characteristic: Uuid,
        data: &[u8],
        require_ack: bool,
    ) -> Result<(), TransportError> {
        let request = CharacteristicWriteRequest {
            op_type: if require_ack {
                WriteOp::Request
            } else {
                WriteOp::Command
            },
            ..Default::default()
        };

        connection
            .characteristic(characteristic)?
            .write_ext(data, &request)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn disconnect(&mut self, connection: Self::Connection) -> Result<(), TransportError> {
        for forwarder in &connection.forwarders {
            forwarder.abort();
        }

        connection
            .device
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

use bluer::Uuid;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::bluetooth::transport::Transport;
use crate::error::TransportError;
use crate::models::Peripheral;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Scan(Duration),
    Connect(String),
    Subscribe(Uuid),
    Write(Uuid, Vec<u8>, bool),
    Disconnect(String),
}

#[derive(Debug, Default)]
pub struct MockSession {
    pub address: String,
}

/// Scripted transport: each write may answer with queued notifications
#[derive(Debug, Default)]
pub struct MockTransport {
    pub peripherals: Vec<Peripheral>,
    pub replies: HashMap<u8, Vec<Vec<u8>>>,
    pub fail_write: Option<u8>,
    pub fail_scan: bool,
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    /// Close the notification channel right after this opcode is written
    pub drop_link_after: Option<u8>,
    pub calls: Vec<Call>,
    sender: Option<mpsc::Sender<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: &str, address: &str) -> Self {
        Self {
            peripherals: vec![Peripheral {
                name: Some(name.to_string()),
                address: address.to_string(),
            }],
            ..Self::default()
        }
    }

    pub fn reply(mut self, opcode: u8, notifications: Vec<Vec<u8>>) -> Self {
        self.replies.insert(opcode, notifications);
        self
    }

    pub fn written_opcodes(&self) -> Vec<u8> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(_, data, _) => data.first().copied(),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    type Connection = MockSession;

    async fn scan(&mut self, timeout: Duration) -> Result<Vec<Peripheral>, TransportError> {
        self.calls.push(Call::Scan(timeout));
        if self.fail_scan {
            return Err(TransportError::Scan("org.bluez.Error.NotReady".to_string()));
        }
        Ok(self.peripherals.clone())
    }

    async fn connect(&mut self, address: &str) -> Result<Self::Connection, TransportError> {
        self.calls.push(Call::Connect(address.to_string()));
        if self.fail_connect {
            return Err(TransportError::Connection(
                "le-connection-abort-by-local".to_string(),
            ));
        }
        Ok(MockSession {
            address: address.to_string(),
        })
    }

    async fn subscribe(
        &mut self,
        _connection: &mut Self::Connection,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        self.calls.push(Call::Subscribe(characteristic));
        if self.fail_subscribe {
            return Err(TransportError::Subscribe("Notify not permitted".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.sender = Some(tx);
        Ok(rx)
    }

    async fn write(
        &mut self,
        _connection: &mut Self::Connection,
        characteristic: Uuid,
        data: &[u8],
        require_ack: bool,
    ) -> Result<(), TransportError> {
        self.calls
            .push(Call::Write(characteristic, data.to_vec(), require_ack));

        let opcode = data.first().copied().unwrap_or_default();
        if self.fail_write == Some(opcode) {
            return Err(TransportError::Write("ATT error 0x0e".to_string()));
        }

        if let (Some(sender), Some(notifications)) = (&self.sender, self.replies.get(&opcode)) {
            for notification in notifications {
                sender
                    .try_send(notification.clone())
                    .map_err(|_| TransportError::Disconnected)?;
            }
        }

        if self.drop_link_after == Some(opcode) {
            self.sender = None;
        }
        Ok(())
    }

    async fn disconnect(&mut self, connection: Self::Connection) -> Result<(), TransportError> {
        self.calls.push(Call::Disconnect(connection.address));
        self.sender = None;
        Ok(())
    }
}

/// The narrow BLE capability the session controller needs
use bluer::Uuid;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::TransportError;
use crate::models::Peripheral;

/// Scan, connect, subscribe, write and disconnect against a GATT peripheral.
///
/// Notifications are delivered through the returned channel in arrival
/// order. The channel closing means the link is gone.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Connection;

    /// Peripherals seen within `timeout`, in discovery order
    async fn scan(&mut self, timeout: Duration) -> Result<Vec<Peripheral>, TransportError>;

    async fn connect(&mut self, address: &str) -> Result<Self::Connection, TransportError>;

    async fn subscribe(
        &mut self,
        connection: &mut Self::Connection,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn write(
        &mut self,
        connection: &mut Self::Connection,
        characteristic: Uuid,
        data: &[u8],
        require_ack: bool,
    ) -> Result<(), TransportError>;

    async fn disconnect(&mut self, connection: Self::Connection) -> Result<(), TransportError>;
}

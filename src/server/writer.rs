use crate::colored::Colorize;
use crate::network::Datagram;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use std::sync::Arc;

/// Sends the daemon's datagrams in the order the engine produced them, waiting for the
/// socket whenever its send buffer is full.
pub async fn run(socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<Datagram>) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(err) = socket.send_to(&datagram.bytes, datagram.to).await {
            warn!("[{}] sending {} bytes to {} failed: {}", "net".cyan(), datagram.bytes.len(), datagram.to, err);
        }
    }
    debug!("[{}] writer stopped", "net".cyan());
}

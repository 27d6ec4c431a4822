use super::daemon::{Daemon, Incoming, Sockets};

use crate::colored::Colorize;
use crate::engine::{Channel, Priority};

use actix::Addr;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::codec::BytesCodec;
use tokio_util::udp::UdpFramed;
use tracing::{debug, warn};

/// Reads both sockets and hands every datagram to the daemon, one at a time.
///
/// When both channels are ready the one named by the daemon's current priority is read first.
pub async fn run(daemon: Addr<Daemon>, sockets: Sockets, priority: watch::Receiver<Priority>) {
    let mut broadcast = UdpFramed::new(sockets.broadcast, BytesCodec::new());
    let mut token = UdpFramed::new(sockets.token, BytesCodec::new());
    loop {
        let token_first = *priority.borrow() == Priority::TokenFirst;
        let (channel, next) = if token_first {
            tokio::select! {
                biased;
                Some(next) = token.next() => (Channel::Token, next),
                Some(next) = broadcast.next() => (Channel::Broadcast, next),
                else => break,
            }
        } else {
            tokio::select! {
                biased;
                Some(next) = broadcast.next() => (Channel::Broadcast, next),
                Some(next) = token.next() => (Channel::Token, next),
                else => break,
            }
        };
        let bytes = match next {
            Ok((bytes, _from)) => bytes.freeze(),
            Err(err) => {
                warn!("[{}] {:?} socket read failed: {}", "net".cyan(), channel, err);
                continue;
            }
        };
        if daemon.send(Incoming { channel, bytes }).await.is_err() {
            break;
        }
    }
    debug!("[{}] reader stopped", "net".cyan());
}

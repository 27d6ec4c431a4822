use actix_derive::Message;
use super::{reader, writer};

use crate::colored::Colorize;
use crate::conf::Configuration;
use crate::engine::{Channel, Delivery, Engine, EngineOptions, Priority, Status};
use crate::network::Datagram;
use crate::proc_id::ProcId;
use crate::wire::Service;
use crate::{Error, Result};

use actix::{Actor, ActorContext, AsyncContext, Context, Handler, Recipient, SpawnHandle};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Exit code of a daemon stopped by a protocol invariant violation.
pub const FATAL_EXIT_CODE: i32 = 2;

/// A datagram read from one of the daemon's sockets.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Incoming {
    pub channel: Channel,
    pub bytes: Bytes,
}

/// A message from the layer above, to be ordered on the ring.
#[derive(Debug, Clone, Message)]
#[rtype(result = "Result<()>")]
pub struct Submit {
    pub service: Service,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Status")]
pub struct GetStatus;

/// The broadcast channel (`port`, also used for sending) and the token channel (`port + 1`).
#[derive(Debug, Clone)]
pub struct Sockets {
    pub broadcast: Arc<UdpSocket>,
    pub token: Arc<UdpSocket>,
}

impl Sockets {
    pub async fn bind(conf: &Configuration, me: ProcId) -> Result<Sockets> {
        let seg_index = conf.segment_of(me).ok_or(Error::UnknownProc(me))?;
        let port = conf.segment(seg_index).port;
        let broadcast = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        broadcast.set_broadcast(true)?;
        let token = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port + 1))).await?;
        info!("[{}] listening on ports {} and {}", "net".cyan(), port, port + 1);
        Ok(Sockets { broadcast: Arc::new(broadcast), token: Arc::new(token) })
    }
}

/// Drives an `Engine` from real sockets and a real clock.
pub struct Daemon {
    engine: Engine,
    sockets: Sockets,
    deliveries: Recipient<Delivery>,
    priority: watch::Sender<Priority>,
    priority_rx: watch::Receiver<Priority>,
    outbound: mpsc::UnboundedSender<Datagram>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Datagram>>,
    timer: Option<SpawnHandle>,
}

impl Daemon {
    pub fn new(engine: Engine, sockets: Sockets, deliveries: Recipient<Delivery>) -> Self {
        let (priority, priority_rx) = watch::channel(engine.priority());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Daemon {
            engine,
            sockets,
            deliveries,
            priority,
            priority_rx,
            outbound,
            outbound_rx: Some(outbound_rx),
            timer: None,
        }
    }

    /// Binds the sockets of `me` and builds its engine.
    pub async fn bind(
        conf: Arc<Configuration>,
        me: ProcId,
        options: EngineOptions,
        deliveries: Recipient<Delivery>,
    ) -> Result<Self> {
        let sockets = Sockets::bind(&conf, me).await?;
        let engine = Engine::new(conf, me, options)?;
        Ok(Daemon::new(engine, sockets, deliveries))
    }

    /// Flushes whatever the engine left behind and re-arms the timer.
    fn after(&mut self, ctx: &mut Context<Self>, result: Result<()>) {
        if let Err(err) = result {
            self.fail(ctx, err);
            return;
        }
        for datagram in self.engine.drain_outbound() {
            if let Err(err) = self.outbound.send(datagram) {
                warn!("[{}] writer gone, dropping datagram to {}", "net".cyan(), err.0.to);
            }
        }
        for delivery in self.engine.drain_deliveries() {
            if let Err(err) = self.deliveries.do_send(delivery) {
                warn!("[{}] delivery lost: {}", "prot".yellow(), err);
            }
        }
        self.priority.send_replace(self.engine.priority());
        self.rearm(ctx);
    }

    fn rearm(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.timer.take() {
            ctx.cancel_future(handle);
        }
        if let Some(deadline) = self.engine.next_deadline() {
            let delay = deadline.saturating_duration_since(Instant::now());
            let handle = ctx.run_later(delay, |daemon, ctx| {
                daemon.timer = None;
                let result = daemon.engine.handle_timers(Instant::now());
                daemon.after(ctx, result);
            });
            self.timer = Some(handle);
        }
    }

    fn fail(&mut self, ctx: &mut Context<Self>, err: Error) {
        error!("[{}] fatal: {}", "memb".magenta(), err);
        error!("[{}] {:#?}", "memb".magenta(), self.engine.status());
        actix::System::current().stop_with_code(FATAL_EXIT_CODE);
        ctx.stop();
    }
}

impl Actor for Daemon {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Context<Self>) {
        actix::spawn(reader::run(ctx.address(), self.sockets.clone(), self.priority_rx.clone()));
        if let Some(outbound) = self.outbound_rx.take() {
            actix::spawn(writer::run(self.sockets.broadcast.clone(), outbound));
        }
        let result = self.engine.start(Instant::now());
        self.after(ctx, result);
    }

    fn stopped(&mut self, _ctx: &mut Context<Self>) {
        info!("[{}] daemon {} stopped", "memb".magenta(), self.engine.me());
    }
}

impl Handler<Incoming> for Daemon {
    type Result = ();

    fn handle(&mut self, msg: Incoming, ctx: &mut Context<Self>) -> Self::Result {
        let result = self.engine.handle_datagram(Instant::now(), msg.channel, &msg.bytes);
        self.after(ctx, result);
    }
}

impl Handler<Submit> for Daemon {
    type Result = Result<()>;

    fn handle(&mut self, msg: Submit, ctx: &mut Context<Self>) -> Self::Result {
        match self.engine.submit(Instant::now(), msg.service, msg.payload) {
            Err(err @ Error::MessageTooLarge(_)) => Err(err),
            result => {
                self.after(ctx, result);
                Ok(())
            }
        }
    }
}

impl Handler<GetStatus> for Daemon {
    type Result = Status;

    fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self>) -> Self::Result {
        self.engine.status()
    }
}

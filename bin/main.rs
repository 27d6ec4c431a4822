use tracing::{error, info};
use tracing_subscriber;

use actix::{Actor, Addr, Context, Handler};
use bytes::Bytes;
use clap::{value_t, App, Arg};
use tokio::io::{AsyncBufReadExt, BufReader};

use ringcast::engine::Delivery;
use ringcast::server::{Daemon, Settings, Submit};
use ringcast::wire::Service;
use ringcast::Result;

use std::path::PathBuf;
use std::sync::Arc;

/// Writes every delivery to the log.
struct DeliveryLog;

impl Actor for DeliveryLog {
    type Context = Context<Self>;
}

impl Handler<Delivery> for DeliveryLog {
    type Result = ();

    fn handle(&mut self, msg: Delivery, _ctx: &mut Context<Self>) -> Self::Result {
        match msg {
            Delivery::Message { sender, service, payload } => {
                info!(target: "ringcast", "{} {:?}: {}", sender, service, String::from_utf8_lossy(&payload))
            }
            Delivery::Transitional { members, memb_id } => {
                info!(target: "ringcast", "transitional {} {:?}", memb_id, members)
            }
            Delivery::Regular { members, memb_id } => info!(target: "ringcast", "regular {} {:?}", memb_id, members),
        }
    }
}

fn default_config() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("ringcast").join("ringcast.toml")
}

/// Submits every line of stdin as an AGREED message.
async fn submit_stdin(daemon: Addr<Daemon>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!(target: "ringcast", "reading stdin: {}", err);
                break;
            }
        };
        let submit = Submit { service: Service::Agreed, payload: Bytes::from(line) };
        match daemon.send(submit).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => error!(target: "ringcast", "message rejected: {}", err),
            Err(_) => break,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_level(false)
        .with_target(false)
        .compact()
        .with_max_level(tracing::Level::INFO)
        .init();

    let matches = App::new("ringcastd")
        .version("0.1")
        .author("zero.fx labs ltd.")
        .about("Runs a ring broadcast daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("CONFIG")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .value_name("NAME")
                .takes_value(true)
                .required(false),
        )
        .arg(Arg::with_name("stdin").long("stdin").help("Submits each line of stdin as an agreed message"))
        .get_matches();

    let config = if matches.is_present("config") {
        value_t!(matches.value_of("config"), PathBuf).unwrap_or_else(|e| e.exit())
    } else {
        default_config()
    };
    let settings = Settings::new(&config, matches.value_of("name"))?;
    let conf = Arc::new(settings.configuration()?);
    let me = settings.me(&conf)?;
    let options = settings.engine_options()?;
    let read_stdin = matches.is_present("stdin");

    let sys = actix::System::new();
    sys.block_on(async move {
        let log = DeliveryLog.start();
        let daemon = match Daemon::bind(conf, me, options, log.recipient()).await {
            Ok(daemon) => daemon.start(),
            Err(err) => {
                error!(target: "ringcast", "cannot start {}: {}", settings.name, err);
                actix::System::current().stop_with_code(1);
                return;
            }
        };
        if read_stdin {
            actix::spawn(submit_stdin(daemon.clone()));
        }

        actix::spawn(async move {
            let sig = if cfg!(unix) {
                use futures::future::FutureExt;
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigint = signal(SignalKind::interrupt()).unwrap();
                let mut sigterm = signal(SignalKind::terminate()).unwrap();

                futures::select! {
                    _ = sigint.recv().fuse() => "SIGINT",
                    _ = sigterm.recv().fuse() => "SIGTERM"
                }
            } else {
                tokio::signal::ctrl_c().await.unwrap();
                "Ctrl+C"
            };
            info!(target: "ringcast", "Got {}, stopping...", sig);

            actix::System::current().stop();
        });
    });
    let code = sys.run_with_code()?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}

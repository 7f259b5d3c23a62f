//! zgwd - Zonal Gateway Daemon
//!
//! TCP front end for the sans-IO gateway core. Accepted diagnostic
//! connections and outbound dials each get one task that turns socket
//! reads into link events, feeds them to the [`Gateway`], and carries out
//! the effects it returns (writes, closes, further dials).
//!
//! # Usage
//!
//! ```bash
//! zgwd config/zgwd.toml
//! zgwd --listen 0.0.0.0:13400 --verbose
//! ```
//!
//! Without a config file the built-in defaults apply: listen on
//! 0.0.0.0:13400 as logical address 0x0201 with no zones.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zgw_doip::LinkEvent;
use zgw_flash::{BankStatus, BootMarker, FileStorage, Storage};
use zgw_gateway::{
    DeviceInventory, Effect, ForwardError, Gateway, GatewayConfig, LinkId, StaticInventory,
    ZoneRouter,
};
use zgw_package::Version;

#[derive(Parser, Debug)]
#[command(name = "zgwd")]
#[command(about = "Zonal gateway daemon: diagnostic server and OTA update engine")]
struct Args {
    /// Configuration file path (TOML). Built-in defaults apply when omitted.
    config: Option<String>,

    /// Override the configured TCP listen endpoint
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "zgwd=debug,zgw_gateway=debug,zgw_doip=debug,zgw_flash=debug,zgw_package=debug"
    } else {
        "zgwd=info,zgw_gateway=info,zgw_doip=info,zgw_flash=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting zgwd (zonal gateway daemon)");

    let config = match &args.config {
        Some(path) => {
            info!(path = %path, "loading configuration");
            GatewayConfig::load(path).context("failed to load configuration")?
        }
        None => {
            info!("no config file provided, running with built-in defaults");
            GatewayConfig::default()
        }
    };

    let listen = args
        .listen
        .unwrap_or_else(|| config.network.listen.clone());
    let layout = config.bank_layout();

    let storage: Arc<dyn Storage> = Arc::new(
        FileStorage::open(Path::new(&config.storage.path), config.storage.capacity)
            .context("failed to open the flash backing file")?,
    );

    let router: Arc<dyn ZoneRouter> = Arc::new(LoggingRouter);
    let inventory: Arc<dyn DeviceInventory> = Arc::new(StaticInventory::from_entries(
        config
            .zones
            .iter()
            .map(|zone| (zone.address, zone.installed_version.clone()))
            .chain(std::iter::once((
                config.network.logical_address,
                config.identity.software_version.clone(),
            ))),
    ));

    info!(
        address = format!("{:#06X}", config.network.logical_address),
        zones = config.zones.len(),
        storage = %config.storage.path,
        "gateway configured"
    );

    let gateway = Arc::new(Gateway::new(
        config,
        Arc::clone(&storage),
        Arc::clone(&storage),
        router,
        inventory,
    ));

    // A persisted marker means the last run staged a bank switch and this
    // boot runs the marker's bank. Both banks held runnable firmware at
    // that point, so both count as healthy.
    if let Some(marker) = BootMarker::load(storage.as_ref(), &layout)
        .context("failed to read the boot marker sector")?
    {
        info!(
            bank = %marker.target_bank,
            version = %Version::from(marker.firmware_version),
            "boot marker found, resuming on the staged bank"
        );
        gateway.installer().set_bank_status(BankStatus {
            active: marker.target_bank,
            a_healthy: true,
            b_healthy: true,
            pending_switch: false,
        });
    }

    let reactor = Reactor::new(Arc::clone(&gateway));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(
        listen = %listen,
        address = format!("{:#06X}", gateway.logical_address()),
        "listening for diagnostic connections"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = reactor.gateway.accept_link();
                    debug!(%id, peer = %peer, "accepted diagnostic connection");
                    let reactor = Arc::clone(&reactor);
                    tokio::spawn(async move {
                        drive_connection(reactor, id, stream).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    info!(open_links = gateway.open_links(), "zgwd stopped");
    Ok(())
}

/// Records handoffs for downstream targets. Delivering a sub-package to a
/// zone ECU is the transport's job, not the daemon's; the handoff is the
/// contract.
struct LoggingRouter;

impl ZoneRouter for LoggingRouter {
    fn forward(
        &self,
        target_id: u16,
        staging_address: u32,
        size: u32,
    ) -> Result<(), ForwardError> {
        info!(
            target = format!("{:#06X}", target_id),
            staging_address = format!("{:#010X}", staging_address),
            size,
            "handing staged firmware to the zone transport"
        );
        Ok(())
    }
}

/// Instruction for the task that owns a connection's write half.
enum Command {
    Write(Vec<u8>),
    Shutdown,
}

/// Applies [`Effect`]s produced by the core to real sockets.
///
/// Each connection is owned by one task; writes are funneled through a
/// per-link channel so an effect raised while servicing one connection can
/// reach another.
struct Reactor {
    gateway: Arc<Gateway>,
    writers: Mutex<HashMap<LinkId, mpsc::UnboundedSender<Command>>>,
}

impl Reactor {
    fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            writers: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, id: LinkId, sender: mpsc::UnboundedSender<Command>) {
        self.writers.lock().insert(id, sender);
    }

    fn deregister(&self, id: LinkId) {
        self.writers.lock().remove(&id);
    }

    /// Feed one link event into the core and carry out what it asks for.
    fn dispatch(self: &Arc<Self>, id: LinkId, event: LinkEvent) {
        let effects = self.gateway.handle_event(id, event);
        self.apply(effects);
    }

    fn apply(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { link, bytes } => {
                    let delivered = match self.writers.lock().get(&link) {
                        Some(sender) => sender.send(Command::Write(bytes)).is_ok(),
                        None => false,
                    };
                    if !delivered {
                        debug!(%link, "dropping send effect, connection is gone");
                    }
                }
                Effect::Close { link } => {
                    if let Some(sender) = self.writers.lock().remove(&link) {
                        let _ = sender.send(Command::Shutdown);
                    }
                }
                Effect::Connect { link, endpoint } => {
                    let reactor = Arc::clone(self);
                    tokio::spawn(async move {
                        reactor.dial(link, endpoint).await;
                    });
                }
            }
        }
    }

    async fn dial(self: Arc<Self>, id: LinkId, endpoint: String) {
        match TcpStream::connect(&endpoint).await {
            Ok(stream) => {
                debug!(%id, endpoint = %endpoint, "outbound connection established");
                drive_connection(self, id, stream).await;
            }
            Err(e) => {
                warn!(%id, endpoint = %endpoint, error = %e, "outbound dial failed");
                self.dispatch(id, LinkEvent::Failed);
            }
        }
    }
}

/// Owns one TCP connection and bridges it to the core: socket reads become
/// link events, write commands become socket writes.
async fn drive_connection(reactor: Arc<Reactor>, id: LinkId, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (sender, mut commands) = mpsc::unbounded_channel();
    reactor.register(id, sender);
    reactor.dispatch(id, LinkEvent::Connected);

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Write(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        warn!(%id, error = %e, "socket write failed");
                        reactor.dispatch(id, LinkEvent::Failed);
                        break;
                    }
                }
                Some(Command::Shutdown) | None => {
                    let _ = writer.shutdown().await;
                    break;
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    reactor.dispatch(id, LinkEvent::Closed);
                    break;
                }
                Ok(n) => reactor.dispatch(id, LinkEvent::Data(buf[..n].to_vec())),
                Err(e) => {
                    debug!(%id, error = %e, "socket read failed");
                    reactor.dispatch(id, LinkEvent::Failed);
                    break;
                }
            },
        }
    }

    reactor.deregister(id);
    debug!(%id, "connection task finished");
}

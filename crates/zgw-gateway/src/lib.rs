//! Zonal gateway core.
//!
//! Everything between the wire and the flash lives here: the
//! [`gateway::Gateway`] manages links and turns transport events into I/O
//! effects, [`services`] dispatches diagnostic requests,
//! [`download::DownloadEngine`] runs firmware download sessions,
//! [`install::Installer`] writes verified firmware into the inactive bank
//! or hands containers to downstream zones, and [`client::ClientPool`]
//! bounds the outbound requests the gateway issues on its own behalf.
//!
//! The crate is sans-IO throughout: sockets, files and the async runtime
//! belong to the daemon binary.

pub mod client;
pub mod config;
pub mod download;
pub mod gateway;
pub mod install;
pub mod services;

pub use client::{ClientCallback, ClientError, ClientPool, ContextId};
pub use config::{ConfigError, GatewayConfig};
pub use download::{DownloadEngine, DownloadPhase, DownloadSession, StagedContainer};
pub use gateway::{Effect, Gateway, LinkId};
pub use install::{
    DeviceInventory, DistributionReport, ForwardError, InstallError, Installer, StaticInventory,
    ZoneRouter,
};
pub use services::dispatch;

//! Firmware container handling for the zonal gateway.
//!
//! [`container`] defines the binary format, [`validator`] checks staged
//! containers through the flash storage abstraction, [`builder`] assembles
//! containers for tooling and tests, and [`version`] holds the packed
//! firmware version type used throughout.

pub mod builder;
pub mod container;
pub mod validator;
pub mod version;

pub use builder::{ContainerBuilder, TargetSpec};
pub use container::{
    ContainerHeader, DependencyEdge, PackageError, PackageResult, TargetEntry, TargetMetadata,
};
pub use validator::{crc_region, ContainerValidator};
pub use version::Version;

//! Command implementations for zgw-cli

pub mod flash;
pub mod inspect;
pub mod pack;
pub mod read_did;
pub mod routine;

pub use flash::flash;
pub use inspect::inspect;
pub use pack::pack;
pub use read_did::read_did;
pub use routine::routine;

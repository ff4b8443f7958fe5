//! Clients for the external collaborators (secret store, image registry,
//! function platform)

pub mod harbor;
pub mod oscar;
pub mod vault;

pub use harbor::HarborClient;
pub use oscar::OscarClient;
pub use vault::VaultClient;

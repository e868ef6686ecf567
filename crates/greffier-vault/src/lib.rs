pub mod vault;

mod error;

pub use error::VaultError;
pub use vault::Vault;

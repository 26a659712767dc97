//! Master key custody and the records that gate access to it.
//!
//! - [`MasterKeyStore`]: the one live master key, wiped on every release path.
//! - [`MasterPasswordFiles`]: salt, KDF parameters and verification token.
//! - [`RecoveryCodes`]: single-use codes that reset the attempt counters.

mod key_store;
mod master;
mod recovery;

pub use key_store::MasterKeyStore;
pub use master::{MasterPasswordFiles, MasterRecord, SALT_SIZE};
pub use recovery::{RecoveryCodes, RECOVERY_CODE_COUNT};

mod config;
mod files;
mod raw;

pub use config::{default_data_dir, EngineOptions, SecurityPolicy, DATA_DIR_ENV};
pub use files::{secure_delete_file, write_private_file, DeleteReport, SecureStorage, FILE_SUFFIX};
pub use raw::RawStore;

pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use config::CliConfig;
pub use core::dispatch::{ApiMethod, ApiTarget, SalesforceClient};
pub use core::pipeline::{GoogleBackends, LoadPipeline};
pub use core::source::{CsvOptions, FileSource, SourceDescriptor, StorageSource, WarehouseSource};
pub use core::transform::RecordTransformer;
pub use domain::model::{DispatchSummary, Record};
pub use domain::ports::{RecordSource, SecretStore};
pub use utils::error::{LoaderError, Result};

//! Error types for the sorting engine

use thiserror::Error;

use crate::radix_sort::SortType;

/// Result type for sorting operations
pub type SortResult<T> = Result<T, SortError>;

/// Errors reported synchronously by the sorter and the compute targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SortError {
    #[error("no sort backend selected")]
    NoBackend,

    #[error("{0} sort kernels are missing or unsupported on this compute target")]
    InvalidBackend(SortType),

    #[error("sort resources have not been initialized")]
    NotInitialized,

    #[error("{count} keys exceed the {limit} supported by the {sort_type} sort")]
    CountTooLarge {
        sort_type: SortType,
        count: u32,
        limit: u64,
    },

    #[error("kernel `{kernel}` has no buffer bound to `{name}`")]
    MissingBinding { kernel: String, name: String },

    #[error("kernel `{kernel}` reads parameter `{name}` which was never set")]
    MissingParam { kernel: String, name: String },

    #[error("buffer `{0}` is bound for writing while it is also in use")]
    BufferAliased(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("compute device error: {0}")]
    Device(String),
}

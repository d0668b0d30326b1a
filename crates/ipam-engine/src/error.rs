use ipam_storage::StorageError;
use miette::Diagnostic;
use thiserror::Error;

/// Pure allocation-engine errors (spec.md §7, the C2/C1-facing subset).
/// `Conflict`, `Timeout`, `NoSliceForNode`, `CollisionDomainHeld` and
/// `NotFound` are classified and retried one layer up, in
/// `ipam_controller::ControllerError` — they never originate here.
#[derive(Error, Debug, Diagnostic)]
pub enum IpamError {
    #[error("Invalid IPAM configuration: {message}")]
    #[diagnostic(
        code(ipam::invalid_config),
        help("Check the range, start/end bounds and exclusion list in the attachment config")
    )]
    InvalidConfig { message: String },

    #[error("Range exhausted: no free address in {cidr}")]
    #[diagnostic(
        code(ipam::range_exhausted),
        help("Expand the range or bounds, or release unused reservations")
    )]
    RangeExhausted { cidr: String },

    #[error("Requested fixed offset is already in use: {offset}")]
    #[diagnostic(
        code(ipam::address_in_use),
        help("Pick a different fixed offset or omit it to let the allocator choose")
    )]
    AddressInUse { offset: String },

    #[error("Requested fixed offset is out of range: {offset}")]
    #[diagnostic(
        code(ipam::out_of_range),
        help("The fixed offset must resolve to an address strictly inside the usable window")
    )]
    OutOfRange { offset: String },
}

pub type Result<T> = std::result::Result<T, IpamError>;

impl IpamError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn range_exhausted(cidr: impl Into<String>) -> Self {
        Self::RangeExhausted { cidr: cidr.into() }
    }

    pub fn address_in_use(offset: impl std::fmt::Display) -> Self {
        Self::AddressInUse {
            offset: offset.to_string(),
        }
    }

    pub fn out_of_range(offset: impl std::fmt::Display) -> Self {
        Self::OutOfRange {
            offset: offset.to_string(),
        }
    }
}

/// Combined error for C3 (`pool_store`) and C4 (`overlap`), which sit on
/// top of both the pure allocator and the storage backend. Kept separate
/// from [`IpamError`] so that C1/C2 stay storage-agnostic and can be unit
/// tested with no backend at all.
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

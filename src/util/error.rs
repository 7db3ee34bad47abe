//! Error types for the ray-tracing core.

use thiserror::Error;

use crate::rtpipe::ShaderStage;

/// Main error type for rtcore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An instance with this caller-assigned id is already in the instance set
    #[error("Duplicate instance id: {0}")]
    DuplicateId(u64),

    /// Handle or key is not (or no longer) present
    #[error("Not found: {0}")]
    NotFound(String),

    /// An instance references a BLAS that has already been destroyed
    #[error("Instance {instance_id} references a destroyed BLAS")]
    DanglingReference { instance_id: u64 },

    /// Shader group indices of a region do not form the range 0..n
    #[error("Non-contiguous group index {index} in {region} region (expected {expected})")]
    NonContiguousGroupIndex {
        region: &'static str,
        index: u32,
        expected: u32,
    },

    /// Entry data size changed after groups or data were recorded
    #[error("SBT layout already finalized")]
    LayoutAlreadyFinalized,

    /// User data does not fit the configured per-entry data block
    #[error("Entry data too large: {size} bytes (max {max})")]
    DataTooLarge { size: usize, max: usize },

    /// One-shot build was already performed
    #[error("Already built")]
    AlreadyBuilt,

    /// A shader stage failed to compile or link into the pipeline
    #[error("Compilation failed in {stage:?} stage: {diagnostic}")]
    CompilationFailure {
        stage: ShaderStage,
        diagnostic: String,
    },

    /// GPU memory exhausted
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailure { size: u64, reason: String },

    /// Mesh data rejected before upload
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Instance attribute does not fit its GPU record field
    #[error("Invalid instance: {0}")]
    InvalidInstance(String),

    /// Device was lost; all GPU-backed state is invalid
    #[error("Device lost")]
    DeviceLost,

    /// The top-level structure was requested before the first successful rebuild
    #[error("TLAS has not been built yet")]
    TlasNotBuilt,

    /// A shader group holds stages that do not belong in it
    #[error("Invalid shader group: {0}")]
    InvalidGroup(String),

    /// An SBT entry does not match the group compiled into the pipeline
    #[error("SBT group mismatch in {region} region at index {index}")]
    GroupMismatch { region: &'static str, index: u32 },

    /// Entry stride exceeds the device limit
    #[error("SBT entry stride {stride} exceeds device maximum {max}")]
    StrideTooLarge { stride: u64, max: u64 },

    /// Device lacks a required capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Argument outside the range an operation accepts
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Native API failure not covered by another variant
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings (de)serialization error
    #[error("Settings error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a not-found error from a string.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a backend error from a string.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Fatal errors invalidate every GPU-backed object owned by this core.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }

    /// Programmer errors detected synchronously; never worth retrying.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_)
                | Self::NonContiguousGroupIndex { .. }
                | Self::LayoutAlreadyFinalized
                | Self::DataTooLarge { .. }
                | Self::AlreadyBuilt
                | Self::InvalidGroup(_)
                | Self::GroupMismatch { .. }
                | Self::TlasNotBuilt
                | Self::InvalidGeometry(_)
                | Self::InvalidInstance(_)
                | Self::InvalidArgument(_)
        )
    }
}

/// Result type alias for rtcore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::DataTooLarge { size: 40, max: 32 };
        assert!(e.to_string().contains("40"));
        assert!(e.to_string().contains("32"));

        let e = Error::CompilationFailure {
            stage: ShaderStage::ClosestHit,
            diagnostic: "bad magic".into(),
        };
        assert!(e.to_string().contains("ClosestHit"));
        assert!(e.to_string().contains("bad magic"));
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::DeviceLost.is_fatal());
        assert!(!Error::DeviceLost.is_usage());
        assert!(Error::AlreadyBuilt.is_usage());
        assert!(Error::DuplicateId(7).is_usage());
        assert!(Error::InvalidArgument("extent".into()).is_usage());
        let alloc = Error::AllocationFailure { size: 1, reason: "budget".into() };
        assert!(!alloc.is_usage());
        assert!(!alloc.is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

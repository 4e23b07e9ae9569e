//! The parity tool seam

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// What a verification pass found
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Every target file is intact
    pub is_complete: bool,
    /// Damaged or missing data blocks
    pub damaged_blocks: u32,
    /// Recovery blocks on hand
    pub recovery_blocks_available: u32,
    /// Enough recovery blocks exist to reconstruct the damage
    pub repairable: bool,
    /// Files with damaged blocks
    pub damaged_files: Vec<String>,
    /// Files absent entirely
    pub missing_files: Vec<String>,
}

/// What a repair pass did
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    /// The tool reported success
    pub success: bool,
    /// Files rewritten from recovery data
    pub repaired_files: Vec<String>,
    /// Files that could not be reconstructed
    pub failed_files: Vec<String>,
    /// First error line the tool printed
    pub error: Option<String>,
}

/// Verification and reconstruction backed by redundancy data
///
/// Implementations return [`Error::NotSupported`](crate::Error::NotSupported)
/// when they cannot run at all.
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Check the files described by `par2_file`
    async fn verify(&self, par2_file: &Path) -> Result<VerifyReport>;

    /// Reconstruct damaged or missing files described by `par2_file`
    async fn repair(&self, par2_file: &Path) -> Result<RepairReport>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

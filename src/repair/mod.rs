//! Repair stage
//!
//! Reassembled files arrive with the gaps left by segments no provider could
//! serve. When the plan carried PAR2 data the stage verifies the set and
//! reconstructs damage; without it, any gap is unrepairable.

mod cli;
mod handler;
mod noop;

pub use cli::CliParityHandler;
pub use handler::{ParityHandler, RepairReport, VerifyReport};
pub use noop::NoOpParityHandler;

use crate::error::{Error, Result};
use crate::nzb::FileKind;
use std::path::PathBuf;
use std::sync::Arc;

/// A reassembled file handed to repair
#[derive(Debug, Clone)]
pub struct RepairInput {
    /// Location of the reassembled file
    pub path: PathBuf,
    /// Classification from the plan
    pub kind: FileKind,
    /// Number of zero-filled segments
    pub gaps: usize,
}

/// Result of the repair stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Files are intact (or could not be checked and had no gaps)
    Verified,
    /// Damage was reconstructed from recovery data
    Repaired {
        /// Files rewritten by the tool
        files: Vec<String>,
    },
    /// Damage remains; the job cannot complete
    Unrepairable {
        /// Why repair was impossible
        reason: String,
    },
}

/// Runs verification and reconstruction through a [`ParityHandler`]
#[derive(Clone)]
pub struct RepairStage {
    handler: Arc<dyn ParityHandler>,
}

impl RepairStage {
    /// Stage backed by `handler`
    pub fn new(handler: Arc<dyn ParityHandler>) -> Self {
        Self { handler }
    }

    /// Verify and, if needed, repair `files`
    pub async fn repair(&self, files: &[RepairInput]) -> Result<RepairOutcome> {
        let gaps: usize = files
            .iter()
            .filter(|f| f.kind.is_payload())
            .map(|f| f.gaps)
            .sum();

        let Some(index) = par_index(files) else {
            if gaps == 0 {
                return Ok(RepairOutcome::Verified);
            }
            return Ok(RepairOutcome::Unrepairable {
                reason: format!("{gaps} segment(s) missing and no recovery data present"),
            });
        };

        let report = match self.handler.verify(&index).await {
            Ok(report) => report,
            Err(Error::NotSupported(message)) if gaps == 0 => {
                tracing::warn!(handler = self.handler.name(), %message, "Skipping verification");
                return Ok(RepairOutcome::Verified);
            }
            Err(Error::NotSupported(message)) => {
                return Ok(RepairOutcome::Unrepairable {
                    reason: format!("{gaps} segment(s) missing: {message}"),
                });
            }
            Err(e) => return Err(e),
        };

        if report.is_complete {
            tracing::debug!(par2 = %index.display(), "Recovery set verified");
            return Ok(RepairOutcome::Verified);
        }
        if !report.repairable {
            return Ok(RepairOutcome::Unrepairable {
                reason: format!(
                    "{} damaged block(s), {} recovery block(s) available",
                    report.damaged_blocks, report.recovery_blocks_available
                ),
            });
        }

        tracing::info!(
            par2 = %index.display(),
            damaged_blocks = report.damaged_blocks,
            recovery_blocks = report.recovery_blocks_available,
            "Repairing from recovery data"
        );
        let repaired = self.handler.repair(&index).await?;
        if repaired.success {
            Ok(RepairOutcome::Repaired {
                files: repaired.repaired_files,
            })
        } else {
            Ok(RepairOutcome::Unrepairable {
                reason: repaired
                    .error
                    .unwrap_or_else(|| "par2 repair failed".to_string()),
            })
        }
    }
}

/// The complete PAR2 file to drive the tool with: the index if it arrived
/// intact, otherwise any intact recovery volume
fn par_index(files: &[RepairInput]) -> Option<PathBuf> {
    let intact = |f: &&RepairInput| f.gaps == 0;
    files
        .iter()
        .filter(intact)
        .find(|f| f.kind == FileKind::ParIndex)
        .or_else(|| {
            files
                .iter()
                .filter(intact)
                .find(|f| matches!(f.kind, FileKind::ParVolume { .. }))
        })
        .map(|f| f.path.clone())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

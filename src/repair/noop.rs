use super::handler::{ParityHandler, RepairReport, VerifyReport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;

/// Handler used when no par2 binary is available
///
/// Every operation reports `NotSupported`; the repair stage then accepts
/// complete downloads unverified and rejects incomplete ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    async fn verify(&self, _par2_file: &Path) -> Result<VerifyReport> {
        Err(Error::NotSupported(
            "PAR2 verification requires a par2 binary; set tools.par2_path or install par2"
                .into(),
        ))
    }

    async fn repair(&self, _par2_file: &Path) -> Result<RepairReport> {
        Err(Error::NotSupported(
            "PAR2 repair requires a par2 binary; set tools.par2_path or install par2".into(),
        ))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

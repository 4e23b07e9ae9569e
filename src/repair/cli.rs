//! par2cmdline-backed handler

use super::handler::{ParityHandler, RepairReport, VerifyReport};
use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Runs an external `par2` binary
#[derive(Debug, Clone)]
pub struct CliParityHandler {
    binary_path: PathBuf,
}

impl CliParityHandler {
    /// Handler for the binary at `binary_path`
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Find `par2` on PATH
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    /// Handler for the configured binary, falling back to PATH when allowed
    pub fn from_config(tools: &ToolsConfig) -> Option<Self> {
        match &tools.par2_path {
            Some(path) => Some(Self::new(path.clone())),
            None if tools.search_path => Self::from_path(),
            None => None,
        }
    }

    async fn run(&self, command: &str, par2_file: &Path) -> Result<std::process::Output> {
        let working_dir = par2_file.parent().unwrap_or_else(|| Path::new("."));
        Command::new(&self.binary_path)
            .arg(command)
            .arg(par2_file)
            .current_dir(working_dir)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute par2: {e}")))
    }
}

#[async_trait]
impl ParityHandler for CliParityHandler {
    async fn verify(&self, par2_file: &Path) -> Result<VerifyReport> {
        let output = self.run("v", par2_file).await?;
        Ok(parse_verify_output(
            &output.stdout,
            &output.stderr,
            output.status.success(),
        ))
    }

    async fn repair(&self, par2_file: &Path) -> Result<RepairReport> {
        let output = self.run("r", par2_file).await?;
        Ok(parse_repair_output(
            &output.stdout,
            &output.stderr,
            output.status.success(),
        ))
    }

    fn name(&self) -> &'static str {
        "cli-par2"
    }
}

/// Interpret `par2 v` output
pub(crate) fn parse_verify_output(stdout: &[u8], stderr: &[u8], success: bool) -> VerifyReport {
    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(stdout),
        String::from_utf8_lossy(stderr)
    );

    let mut report = VerifyReport::default();
    let mut short_of_blocks = false;
    for line in combined.lines() {
        let lower = line.to_lowercase();

        if (lower.contains("damaged") || lower.contains("missing"))
            && !lower.contains("recovery")
            && let Some(count) = number_before_blocks(&lower)
        {
            report.damaged_blocks = report.damaged_blocks.max(count);
        }
        if lower.contains("recovery")
            && lower.contains("block")
            && let Some(count) = number_before_blocks(&lower)
        {
            report.recovery_blocks_available = report.recovery_blocks_available.max(count);
        }
        if lower.contains("more recovery block") {
            short_of_blocks = true;
        }

        if lower.contains("- missing") || lower.starts_with("missing:") {
            push_unique(&mut report.missing_files, filename_in(line));
        } else if lower.contains("- damaged") || lower.starts_with("damaged:") {
            push_unique(&mut report.damaged_files, filename_in(line));
        }
    }

    let damaged = report.damaged_blocks > 0 || !report.missing_files.is_empty();
    report.is_complete = success && !damaged && report.damaged_files.is_empty();
    report.repairable = damaged && report.recovery_blocks_available > 0 && !short_of_blocks;
    report
}

/// Interpret `par2 r` output
pub(crate) fn parse_repair_output(stdout: &[u8], stderr: &[u8], success: bool) -> RepairReport {
    let error_output = String::from_utf8_lossy(stderr);
    let combined = format!("{}\n{}", String::from_utf8_lossy(stdout), error_output);

    let mut report = RepairReport {
        success,
        ..Default::default()
    };
    for line in combined.lines() {
        let lower = line.to_lowercase();
        if lower.contains("repaired") || lower.contains("restored") {
            push_unique(&mut report.repaired_files, filename_in(line));
        }
        if lower.contains("failed") || lower.contains("could not repair") {
            push_unique(&mut report.failed_files, filename_in(line));
        }
        if lower.contains("error") && report.error.is_none() {
            report.error = Some(line.trim().to_string());
        }
    }
    if !success && report.error.is_none() && !error_output.trim().is_empty() {
        report.error = Some(error_output.trim().to_string());
    }
    report
}

fn push_unique(list: &mut Vec<String>, name: Option<String>) {
    if let Some(name) = name
        && !list.contains(&name)
    {
        list.push(name);
    }
}

/// Nearest number before the word "block(s)"
///
/// Handles "5 blocks damaged", "Found 1999 of 2000 data blocks" and
/// "You have 577 recovery blocks available".
fn number_before_blocks(line: &str) -> Option<u32> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let at = words.iter().position(|w| w.starts_with("block"))?;
    words[..at].iter().rev().find_map(|w| w.parse().ok())
}

/// Quoted filename, or whatever follows the first colon
fn filename_in(line: &str) -> Option<String> {
    if let Some(start) = line.find('"')
        && let Some(len) = line[start + 1..].find('"')
    {
        return Some(line[start + 1..start + 1 + len].to_string());
    }
    line.split_once(':')
        .map(|(_, rest)| rest.trim().trim_end_matches('.').to_string())
        .filter(|name| !name.is_empty())
}

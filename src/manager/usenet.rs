//! NZB jobs: segment retrieval, reassembly, repair and extraction.

use super::DownloadManager;
use super::background_tasks::{
    ByteCounter, ProgressReporterParams, spawn_progress_reporter, spawn_segment_writer,
};
use crate::assembler::{AssembledFile, Reassembler, SpooledPart};
use crate::db::{JobRow, SegmentRow, SegmentUpdate};
use crate::error::{FetchError, JobError, Result};
use crate::extraction::{ExtractionStage, PasswordList};
use crate::fetcher::{FetchOutcome, ProviderExclusions};
use crate::nzb::{self, NzbFile, NzbPlan, Segment};
use crate::repair::{RepairInput, RepairOutcome};
use crate::types::{Event, JobId, JobStatus, SegmentStatus};
use crate::utils::sanitize_filename;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type SegmentKey = (usize, usize);

/// A segment no provider could deliver
struct MissingSegment {
    message_id: String,
    error: FetchError,
}

/// What segment retrieval produced for the whole plan
#[derive(Default)]
struct Retrieval {
    /// Spooled bytes per segment
    spooled: HashMap<SegmentKey, SpooledPart>,
    /// Encoder-declared size per file
    file_sizes: HashMap<usize, u64>,
    failed: Vec<MissingSegment>,
    /// Set when failures remain and every provider was excluded: first provider and why
    providers_exhausted: Option<(String, String)>,
    cancelled: bool,
}

enum SegmentResult {
    Done {
        key: SegmentKey,
        spool: SpooledPart,
        file_size: u64,
    },
    Failed(MissingSegment),
    Cancelled,
}

/// Borrowed state shared by a job's fetch workers
struct FetchContext<'a> {
    id: JobId,
    spool_dir: &'a Path,
    prior_attempts: &'a HashMap<SegmentKey, u32>,
    exclusions: &'a ProviderExclusions,
    updates: &'a mpsc::UnboundedSender<SegmentUpdate>,
    downloaded: &'a AtomicU64,
    cancel: &'a CancellationToken,
}

impl DownloadManager {
    /// Run one attempt of an NZB job up to extraction
    ///
    /// Returns the files now in the job's destination directory.
    pub(super) async fn acquire_nzb(
        &self,
        row: &JobRow,
        content: &[u8],
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let id = JobId(row.id);
        let db = &self.inner.db;
        let plan = nzb::parse(content)?;

        db.reset_unfinished_segments(id).await?;
        let mut rows = db.list_segments(id).await?;
        if rows.is_empty() {
            db.insert_segments(id, &plan).await?;
            rows = db.list_segments(id).await?;
        }

        let spool_dir = work_dir.join("segments");
        tokio::fs::create_dir_all(&spool_dir).await?;

        let retrieval = self
            .retrieve_segments(id, &plan, &rows, &spool_dir, cancel)
            .await?;
        if retrieval.cancelled || cancel.is_cancelled() {
            return Err(JobError::Cancelled.into());
        }
        self.check_providers_left(&retrieval)?;

        self.enter_stage(id, JobStatus::Repairing).await?;
        let files_dir = work_dir.join("files");
        let assembled = assemble_files(&plan, &retrieval, &files_dir).await?;
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled.into());
        }

        let inputs: Vec<RepairInput> = assembled
            .iter()
            .map(|(file, output)| RepairInput {
                path: output.path.clone(),
                kind: file.kind,
                gaps: output.gaps.len(),
            })
            .collect();
        match self.inner.repair.repair(&inputs).await? {
            RepairOutcome::Verified => {
                tracing::debug!(job_id = id.0, "Files verified");
            }
            RepairOutcome::Repaired { files } => {
                tracing::info!(job_id = id.0, repaired = files.len(), "Files repaired");
            }
            RepairOutcome::Unrepairable { reason } => {
                return Err(unrepairable(&retrieval, reason).into());
            }
        }
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled.into());
        }

        self.enter_stage(id, JobStatus::Extracting).await?;
        let payload: Vec<PathBuf> = assembled
            .iter()
            .filter(|(file, _)| file.kind.is_payload())
            .map(|(_, output)| output.path.clone())
            .collect();
        let passwords = PasswordList::collect(
            row.password.as_deref(),
            plan.meta.password.as_deref(),
            self.inner.config.tools.try_empty_password,
        );
        let final_dir = Path::new(&row.destination).join(sanitize_filename(&row.name));
        let outputs = ExtractionStage
            .extract(&payload, &work_dir.join("extract"), &final_dir, &passwords)
            .await?;

        tracing::info!(
            job_id = id.0,
            files = outputs.len(),
            dest = %final_dir.display(),
            "Extraction finished"
        );
        Ok(outputs)
    }

    async fn retrieve_segments(
        &self,
        id: JobId,
        plan: &NzbPlan,
        rows: &[SegmentRow],
        spool_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Retrieval> {
        let mut retrieval = Retrieval::default();
        let mut prior_attempts = HashMap::new();
        let mut declared = HashMap::new();
        for segment in plan.segments() {
            declared.insert((segment.file_index, segment.segment_index), segment.bytes);
        }

        let downloaded = Arc::new(AtomicU64::new(0));
        for row in rows {
            let key = (row.file_index as usize, row.segment_index as usize);
            prior_attempts.insert(key, row.attempts.max(0) as u32);
            if let Some(size) = row.file_size {
                retrieval.file_sizes.insert(key.0, size.max(0) as u64);
            }
            if row.status() == SegmentStatus::Done
                && let Some(spool) = row.spool_path.as_deref()
                && let Some(offset) = row.part_offset
                && tokio::fs::try_exists(spool).await.unwrap_or(false)
            {
                retrieval.spooled.insert(
                    key,
                    SpooledPart {
                        path: PathBuf::from(spool),
                        offset: offset.max(0) as u64,
                    },
                );
                downloaded.fetch_add(declared.get(&key).copied().unwrap_or(0), Ordering::Relaxed);
            }
        }

        let pending: Vec<&Segment> = plan
            .segments()
            .filter(|s| !retrieval.spooled.contains_key(&(s.file_index, s.segment_index)))
            .collect();
        if !retrieval.spooled.is_empty() {
            tracing::info!(
                job_id = id.0,
                reused = retrieval.spooled.len(),
                remaining = pending.len(),
                "Resuming from spooled segments"
            );
        }

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let writer = spawn_segment_writer(id, Arc::clone(&self.inner.db), update_rx);
        let stop = CancellationToken::new();
        let reporter = spawn_progress_reporter(ProgressReporterParams {
            id,
            counter: ByteCounter::Segments {
                downloaded: Arc::clone(&downloaded),
                total: plan.total_bytes(),
            },
            interval: self.inner.config.download.progress_interval,
            event_tx: self.inner.event_tx.clone(),
            db: Arc::clone(&self.inner.db),
            stop: stop.clone(),
        });

        let exclusions = ProviderExclusions::new();
        let concurrency = self.provider_pool().total_connections().max(1);
        let ctx = FetchContext {
            id,
            spool_dir,
            prior_attempts: &prior_attempts,
            exclusions: &exclusions,
            updates: &update_tx,
            downloaded: &downloaded,
            cancel,
        };
        tracing::debug!(job_id = id.0, segments = pending.len(), concurrency, "Fetching segments");

        let fetches: Vec<BoxFuture<'_, Result<SegmentResult>>> = pending
            .into_iter()
            .map(|segment| self.fetch_segment(&ctx, segment).boxed())
            .collect();
        let results: Vec<Result<SegmentResult>> = stream::iter(fetches)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        drop(update_tx);
        stop.cancel();
        if let Err(e) = reporter.await {
            tracing::error!(job_id = id.0, error = %e, "Progress reporter panicked");
        }
        if let Err(e) = writer.await {
            tracing::error!(job_id = id.0, error = %e, "Segment writer panicked");
        }

        for result in results {
            match result? {
                SegmentResult::Done {
                    key,
                    spool,
                    file_size,
                } => {
                    retrieval.spooled.insert(key, spool);
                    retrieval.file_sizes.entry(key.0).or_insert(file_size);
                }
                SegmentResult::Failed(missing) => retrieval.failed.push(missing),
                SegmentResult::Cancelled => retrieval.cancelled = true,
            }
        }

        if !retrieval.failed.is_empty() {
            let providers = self.provider_pool().ordered();
            if providers.iter().all(|p| exclusions.contains(*p)) {
                retrieval.providers_exhausted = Some(match providers.first() {
                    Some(first) => (
                        self.provider_name(*first)
                            .unwrap_or_else(|| first.to_string()),
                        exclusions.reason(*first).unwrap_or_default(),
                    ),
                    None => ("none".to_string(), "no enabled provider".to_string()),
                });
            }
            tracing::warn!(
                job_id = id.0,
                failed = retrieval.failed.len(),
                "Segments could not be retrieved from any provider"
            );
        }
        Ok(retrieval)
    }

    async fn fetch_segment(&self, ctx: &FetchContext<'_>, segment: &Segment) -> Result<SegmentResult> {
        let key = (segment.file_index, segment.segment_index);
        let prior = ctx.prior_attempts.get(&key).copied().unwrap_or(0);
        let update = |status, provider, attempts, last_error, file_size, spool: Option<&SpooledPart>| SegmentUpdate {
            file_index: segment.file_index,
            segment_index: segment.segment_index,
            status,
            provider,
            attempts,
            last_error,
            file_size,
            spool_path: spool.map(|s| s.path.clone()),
            part_offset: spool.map(|s| s.offset),
        };

        ctx.updates
            .send(update(SegmentStatus::Fetching, None, prior, None, None, None))
            .ok();

        let outcome = self
            .inner
            .fetcher
            .fetch_with_failover(segment, ctx.exclusions, ctx.cancel)
            .await;
        self.report_exclusions(ctx.id, ctx.exclusions);

        match outcome {
            FetchOutcome::Done(fetched) => {
                let spool = ctx.spool_dir.join(format!(
                    "{}_{}.seg",
                    segment.file_index, segment.segment_index
                ));
                tokio::fs::write(&spool, &fetched.part.data).await?;
                let spool = SpooledPart {
                    path: spool,
                    offset: fetched.part.offset(),
                };
                ctx.downloaded.fetch_add(segment.bytes, Ordering::Relaxed);

                let provider = self.provider_name(fetched.provider);
                ctx.updates
                    .send(update(
                        SegmentStatus::Done,
                        provider,
                        prior + fetched.attempts,
                        None,
                        Some(fetched.part.file_size),
                        Some(&spool),
                    ))
                    .ok();
                Ok(SegmentResult::Done {
                    key,
                    spool,
                    file_size: fetched.part.file_size,
                })
            }
            FetchOutcome::Failed {
                attempts,
                provider,
                error,
            } => {
                tracing::debug!(
                    job_id = ctx.id.0,
                    message_id = %segment.message_id,
                    attempts,
                    error = %error,
                    "Segment failed on every provider"
                );
                ctx.updates
                    .send(update(
                        SegmentStatus::Failed,
                        provider.and_then(|p| self.provider_name(p)),
                        prior + attempts,
                        Some(error.to_string()),
                        None,
                        None,
                    ))
                    .ok();
                Ok(SegmentResult::Failed(MissingSegment {
                    message_id: segment.message_id.clone(),
                    error,
                }))
            }
            FetchOutcome::Cancelled { attempts } => {
                ctx.updates
                    .send(update(
                        SegmentStatus::Pending,
                        None,
                        prior + attempts,
                        None,
                        None,
                        None,
                    ))
                    .ok();
                Ok(SegmentResult::Cancelled)
            }
        }
    }

    fn report_exclusions(&self, id: JobId, exclusions: &ProviderExclusions) {
        for (provider, reason) in exclusions.take_new() {
            let name = self
                .provider_name(provider)
                .unwrap_or_else(|| provider.to_string());
            tracing::warn!(job_id = id.0, provider = %name, %reason, "Provider excluded for this job");
            self.emit(Event::ProviderExcluded {
                id,
                provider: name,
                reason,
            });
        }
    }

    fn provider_name(&self, provider: crate::provider::ProviderId) -> Option<String> {
        self.provider_pool().provider(provider).map(|p| p.name)
    }

    /// Fail fast when segments are missing because every provider was excluded
    fn check_providers_left(&self, retrieval: &Retrieval) -> Result<()> {
        match &retrieval.providers_exhausted {
            Some((provider, reason)) => Err(JobError::ProtocolFatal {
                provider: provider.clone(),
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

/// Reassemble every file of the plan from its spooled segments
async fn assemble_files<'p>(
    plan: &'p NzbPlan,
    retrieval: &Retrieval,
    files_dir: &Path,
) -> Result<Vec<(&'p NzbFile, AssembledFile)>> {
    tokio::fs::create_dir_all(files_dir).await?;
    let mut used = HashSet::new();
    let mut assembled = Vec::with_capacity(plan.files.len());

    for file in &plan.files {
        let mut name = sanitize_filename(&file.filename);
        if !used.insert(name.clone()) {
            name = format!("{}_{}", file.index, name);
            used.insert(name.clone());
        }
        let parts: Vec<Option<SpooledPart>> = file
            .segments
            .iter()
            .map(|s| retrieval.spooled.get(&(s.file_index, s.segment_index)).cloned())
            .collect();
        let output = Reassembler
            .assemble(
                file,
                &parts,
                retrieval.file_sizes.get(&file.index).copied(),
                &files_dir.join(name),
            )
            .await?;
        assembled.push((file, output));
    }
    Ok(assembled)
}

/// Classify an unrepairable result by what caused the damage
fn unrepairable(retrieval: &Retrieval, reason: String) -> JobError {
    let missing: Vec<&MissingSegment> = retrieval
        .failed
        .iter()
        .filter(|m| !matches!(m.error, FetchError::Corrupt(_)))
        .collect();
    match missing.first() {
        Some(first) => JobError::SegmentMissing {
            missing: missing.len(),
            message_id: first.message_id.clone(),
        },
        None => JobError::IntegrityMismatch(reason),
    }
}

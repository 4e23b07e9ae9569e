use super::*;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;

/// Handler replaying canned reports
struct Scripted {
    verify: VerifyReport,
    repair: RepairReport,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(verify: VerifyReport, repair: RepairReport) -> Arc<Self> {
        Arc::new(Self {
            verify,
            repair,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ParityHandler for Scripted {
    async fn verify(&self, par2_file: &Path) -> Result<VerifyReport> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("verify {}", par2_file.display()));
        Ok(self.verify.clone())
    }

    async fn repair(&self, par2_file: &Path) -> Result<RepairReport> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("repair {}", par2_file.display()));
        Ok(self.repair.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn media(gaps: usize) -> RepairInput {
    RepairInput {
        path: PathBuf::from("/t/movie.mkv"),
        kind: FileKind::Media,
        gaps,
    }
}

fn index() -> RepairInput {
    RepairInput {
        path: PathBuf::from("/t/movie.par2"),
        kind: FileKind::ParIndex,
        gaps: 0,
    }
}

#[tokio::test]
async fn complete_files_without_recovery_data_are_verified() {
    let stage = RepairStage::new(Arc::new(NoOpParityHandler));
    assert_eq!(
        stage.repair(&[media(0)]).await.unwrap(),
        RepairOutcome::Verified
    );
}

#[tokio::test]
async fn gaps_without_recovery_data_are_unrepairable() {
    let stage = RepairStage::new(Arc::new(NoOpParityHandler));
    let outcome = stage.repair(&[media(2)]).await.unwrap();
    assert!(matches!(outcome, RepairOutcome::Unrepairable { reason } if reason.contains("2 segment")));
}

#[tokio::test]
async fn missing_tool_accepts_complete_files_only() {
    let stage = RepairStage::new(Arc::new(NoOpParityHandler));
    assert_eq!(
        stage.repair(&[media(0), index()]).await.unwrap(),
        RepairOutcome::Verified
    );
    assert!(matches!(
        stage.repair(&[media(1), index()]).await.unwrap(),
        RepairOutcome::Unrepairable { .. }
    ));
}

#[tokio::test]
async fn damaged_set_is_repaired() {
    let handler = Scripted::new(
        VerifyReport {
            damaged_blocks: 3,
            recovery_blocks_available: 10,
            repairable: true,
            ..Default::default()
        },
        RepairReport {
            success: true,
            repaired_files: vec!["movie.mkv".into()],
            ..Default::default()
        },
    );
    let stage = RepairStage::new(handler.clone());

    let outcome = stage.repair(&[media(3), index()]).await.unwrap();

    assert_eq!(
        outcome,
        RepairOutcome::Repaired {
            files: vec!["movie.mkv".into()]
        }
    );
    assert_eq!(
        handler.calls(),
        vec!["verify /t/movie.par2", "repair /t/movie.par2"]
    );
}

#[tokio::test]
async fn too_little_recovery_data_is_unrepairable_without_running_repair() {
    let handler = Scripted::new(
        VerifyReport {
            damaged_blocks: 30,
            recovery_blocks_available: 10,
            repairable: false,
            ..Default::default()
        },
        RepairReport::default(),
    );
    let stage = RepairStage::new(handler.clone());

    let outcome = stage.repair(&[media(30), index()]).await.unwrap();

    assert!(matches!(outcome, RepairOutcome::Unrepairable { .. }));
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test]
async fn damaged_index_falls_back_to_a_volume() {
    let handler = Scripted::new(
        VerifyReport {
            is_complete: true,
            ..Default::default()
        },
        RepairReport::default(),
    );
    let stage = RepairStage::new(handler.clone());
    let mut broken_index = index();
    broken_index.gaps = 1;
    let volume = RepairInput {
        path: PathBuf::from("/t/movie.vol00+01.par2"),
        kind: FileKind::ParVolume {
            block_offset: 0,
            block_count: 1,
        },
        gaps: 0,
    };

    let outcome = stage
        .repair(&[media(0), broken_index, volume])
        .await
        .unwrap();

    assert_eq!(outcome, RepairOutcome::Verified);
    assert_eq!(handler.calls(), vec!["verify /t/movie.vol00+01.par2"]);
}

//! Post-completion quality scoring.
//!
//! The gate runs after a job is already `Completed` and only annotates it:
//! a low score, or a gate that cannot inspect the artifacts at all, never
//! reopens or retries the job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::job::Artifact;
use kiln_core::quality_gate::{
    completeness_check, resolution_check, style_checks, summarize, CheckOutcome, CheckStatus,
    QualityCriteria, QualityResult, CHECK_READABLE,
};
use kiln_core::types::JobId;
use tokio_util::task::TaskTracker;

use crate::table::JobTable;

/// File extensions whose dimensions are read from the image header.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Suffix of the optional style-score sidecar next to an artifact.
const STYLE_SIDECAR_SUFFIX: &str = ".quality.json";

#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn score(&self, artifacts: &[Artifact], criteria: &QualityCriteria) -> QualityResult;
}

// ---------------------------------------------------------------------------
// Artifact inspection
// ---------------------------------------------------------------------------

/// Scores artifacts found on disk under `root`.
///
/// Checks asset completeness, image resolution from the file header, and
/// style scores from an `<artifact>.quality.json` sidecar mapping check
/// names to scores in `[0, 1]`.
pub struct ArtifactQualityGate {
    root: PathBuf,
}

impl ArtifactQualityGate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

async fn inspect(path: PathBuf, artifact: &str, criteria: &QualityCriteria) -> Result<CheckOutcome, String> {
    if is_image(&path) {
        let dims = tokio::task::spawn_blocking(move || image::image_dimensions(&path))
            .await
            .map_err(|e| format!("inspection of {artifact} panicked: {e}"))?;
        let (width, height) = dims.map_err(|e| format!("{artifact} is unreadable: {e}"))?;
        return Ok(resolution_check(artifact, width, height, criteria));
    }

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() > 0 => Ok(CheckOutcome::pass(CHECK_READABLE)),
        Ok(_) => Ok(CheckOutcome::with_status(
            CHECK_READABLE,
            CheckStatus::Fail,
            format!("{artifact} is empty"),
        )),
        Err(e) => Err(format!("{artifact} is unreadable: {e}")),
    }
}

async fn load_style_scores(path: &Path) -> BTreeMap<String, f64> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(STYLE_SIDECAR_SUFFIX);

    let Ok(raw) = tokio::fs::read(&sidecar).await else {
        return BTreeMap::new();
    };
    serde_json::from_slice(&raw).unwrap_or_else(|e| {
        tracing::warn!(path = %Path::new(&sidecar).display(), error = %e, "Ignoring malformed style scores");
        BTreeMap::new()
    })
}

#[async_trait]
impl QualityGate for ArtifactQualityGate {
    async fn score(&self, artifacts: &[Artifact], criteria: &QualityCriteria) -> QualityResult {
        let mut checks = vec![completeness_check(artifacts.len(), criteria.expected_outputs)];
        let mut style_scores = BTreeMap::new();

        for artifact in artifacts {
            let path = self.resolve(artifact);
            match inspect(path.clone(), &artifact.path, criteria).await {
                Ok(outcome) => checks.push(outcome),
                Err(reason) => return QualityResult::inspection_failed(reason),
            }
            // The lowest score per check across artifacts wins.
            for (name, score) in load_style_scores(&path).await {
                style_scores
                    .entry(name)
                    .and_modify(|current: &mut f64| *current = current.min(score))
                    .or_insert(score);
            }
        }

        checks.extend(style_checks(&style_scores, criteria));
        summarize(&checks, criteria.pass_score)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs the gate off the orchestration path and attaches the result to the
/// job record.
#[derive(Clone)]
pub struct QualityRunner {
    gate: Arc<dyn QualityGate>,
    criteria: Arc<QualityCriteria>,
    table: Arc<JobTable>,
    tasks: TaskTracker,
}

impl QualityRunner {
    pub fn new(
        gate: Arc<dyn QualityGate>,
        criteria: QualityCriteria,
        table: Arc<JobTable>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            gate,
            criteria: Arc::new(criteria),
            table,
            tasks,
        }
    }

    pub fn spawn(&self, job_id: JobId, outputs: Vec<Artifact>) {
        let runner = self.clone();
        self.tasks.spawn(async move {
            let result = runner.gate.score(&outputs, &runner.criteria).await;
            tracing::info!(
                job_id = %job_id,
                score = result.score,
                passed = result.passed,
                issues = result.issues.len(),
                "Quality gate scored job",
            );
            runner.table.attach_quality(&job_id, result);
        });
    }
}

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum_macros::Display;

use crate::enhancement::Variant;
use crate::utils::OutputKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Output files produced for a job, filled in as steps succeed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait_jpeg: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait_png: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portrait_background: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_jpeg: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_png: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub square_background: Option<PathBuf>,
}

impl OutputPaths {
    fn slot_mut(&mut self, variant: Variant, kind: OutputKind) -> &mut Option<PathBuf> {
        match (variant, kind) {
            (Variant::Portrait, OutputKind::Jpeg) => &mut self.portrait_jpeg,
            (Variant::Portrait, OutputKind::Transparent) => &mut self.portrait_png,
            (Variant::Portrait, OutputKind::Background) => &mut self.portrait_background,
            (Variant::Square, OutputKind::Jpeg) => &mut self.square_jpeg,
            (Variant::Square, OutputKind::Transparent) => &mut self.square_png,
            (Variant::Square, OutputKind::Background) => &mut self.square_background,
        }
    }

    pub fn set(&mut self, variant: Variant, kind: OutputKind, path: PathBuf) {
        *self.slot_mut(variant, kind) = Some(path);
    }

    pub fn get(&self, variant: Variant, kind: OutputKind) -> Option<&Path> {
        let slot = match (variant, kind) {
            (Variant::Portrait, OutputKind::Jpeg) => &self.portrait_jpeg,
            (Variant::Portrait, OutputKind::Transparent) => &self.portrait_png,
            (Variant::Portrait, OutputKind::Background) => &self.portrait_background,
            (Variant::Square, OutputKind::Jpeg) => &self.square_jpeg,
            (Variant::Square, OutputKind::Transparent) => &self.square_png,
            (Variant::Square, OutputKind::Background) => &self.square_background,
        };
        slot.as_deref()
    }

    /// All populated paths
    pub fn paths(&self) -> Vec<&Path> {
        [
            &self.portrait_jpeg,
            &self.portrait_png,
            &self.portrait_background,
            &self.square_jpeg,
            &self.square_png,
            &self.square_background,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect()
    }

    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One source image's trip through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source_path: PathBuf,
    pub output_folder: PathBuf,
    pub group_label: String,
    pub base_name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub retries: u32,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub outputs: OutputPaths,
}

impl Job {
    pub fn new(
        source_path: impl Into<PathBuf>,
        output_folder: impl Into<PathBuf>,
        group_label: impl Into<String>,
        base_name: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_job_id(),
            source_path: source_path.into(),
            output_folder: output_folder.into(),
            group_label: group_label.into(),
            base_name: base_name.into(),
            status: JobStatus::Pending,
            retries: 0,
            added_at: Utc::now(),
            completed_at: None,
            error: None,
            outputs: OutputPaths::default(),
        }
    }

    /// `group_label/base_name`, used in logs and status summaries
    pub fn label(&self) -> String {
        format!("{}/{}", self.group_label, self.base_name)
    }
}

/// `job_<unix millis>_<8 random alphanumerics>`
pub fn generate_job_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("job_{}_{}", Utc::now().timestamp_millis(), suffix.to_lowercase())
}

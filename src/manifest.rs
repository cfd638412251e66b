// 🧾 Run Manifest - What a run wrote, with checksums
// manifest.json in the dated run folder

use crate::error::Result;
use crate::extract::ParcelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spreadsheet,
    ParcelMap,
    OverviewMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

impl ArtifactEntry {
    /// Hash a written file. `path` is recorded relative to `root` when possible.
    pub fn from_file(kind: ArtifactKind, root: &Path, path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&content);

        Ok(ArtifactEntry {
            kind,
            path: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
            sha256: format!("{:x}", hasher.finalize()),
            bytes: content.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Rows in the filtered change set.
    pub filtered_changes: usize,
    /// Filtered rows without a usable parcel identifier.
    pub skipped_changes: usize,
    pub distinct_parcels: usize,
    pub selected_features: usize,
    /// Features that received change attributes in the join.
    pub joined_features: usize,
    pub parcel_maps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub run_date: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feature_set: String,
    pub counts: RunCounts,
    /// Change-set identifiers with no parcel in the parcel-area layer.
    pub unmatched_parcels: Vec<ParcelId>,
    pub artifacts: Vec<ArtifactEntry>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

// 📁 Run Workspace - Dated output folders
// <root>/<YYYY_MM_DD>/{excel,pdf}; an existing run folder is never reused

use crate::error::{ConfigError, PipelineError, Result};
use crate::extract::ParcelId;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

pub const EXCEL_DIR: &str = "excel";
pub const PDF_DIR: &str = "pdf";
pub const OVERVIEW_PDF: &str = "Overview_Map.pdf";
pub const MANIFEST_FILE: &str = "manifest.json";

/// The date a run is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunDate(NaiveDate);

impl RunDate {
    pub fn today() -> Self {
        RunDate(Local::now().date_naive())
    }

    /// Parse `YYYY-MM-DD`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(RunDate)
            .map_err(|_| ConfigError::InvalidDate(s.to_string()))
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(RunDate)
    }

    /// `YYYY_MM_DD`, used in every per-run name.
    pub fn stamp(&self) -> String {
        self.0.format("%Y_%m_%d").to_string()
    }
}

impl fmt::Display for RunDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// The three folders of one run and the artifact paths derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct RunWorkspace {
    date: RunDate,
    root: PathBuf,
    excel_dir: PathBuf,
    pdf_dir: PathBuf,
}

impl RunWorkspace {
    /// Paths for `date` under `output_root`, without touching the filesystem.
    pub fn plan(output_root: &Path, date: RunDate) -> Self {
        let root = output_root.join(date.stamp());
        RunWorkspace {
            date,
            excel_dir: root.join(EXCEL_DIR),
            pdf_dir: root.join(PDF_DIR),
            root,
        }
    }

    /// Create the run folders. Fails with `WorkspaceExists` if the dated
    /// folder is already there.
    pub fn create(output_root: &Path, date: RunDate) -> Result<Self> {
        let ws = Self::plan(output_root, date);

        fs::create_dir_all(output_root)?;
        match fs::create_dir(&ws.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PipelineError::WorkspaceExists(ws.root));
            }
            Err(e) => return Err(e.into()),
        }
        fs::create_dir(&ws.excel_dir)?;
        fs::create_dir(&ws.pdf_dir)?;

        info!(root = %ws.root.display(), "run folders created");
        Ok(ws)
    }

    pub fn date(&self) -> RunDate {
        self.date
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn excel_dir(&self) -> &Path {
        &self.excel_dir
    }

    pub fn pdf_dir(&self) -> &Path {
        &self.pdf_dir
    }

    pub fn spreadsheet_path(&self) -> PathBuf {
        self.excel_dir.join(format!("{}.xls", self.date.stamp()))
    }

    pub fn parcel_pdf_path(&self, pin: &ParcelId) -> PathBuf {
        self.pdf_dir.join(format!("PIN_{}.pdf", pin.file_stem()))
    }

    pub fn overview_pdf_path(&self) -> PathBuf {
        self.pdf_dir.join(OVERVIEW_PDF)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

// ⚙️ Run Configuration - Constants as data
// Paths, table/field names, and the excluded building-type list, loaded from JSON

use crate::error::ConfigError;
use crate::query::is_identifier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Building types that never need a planometric update.
pub const DEFAULT_EXCLUDED_TYPES: [&str; 19] = [
    "C101 - SINGLE FAMILY DETACHED",
    "C102 - SINGLE FAMILY ATTACHED",
    "C103 -  TWO FAMILY",
    "C104 -  THREE & FOUR FAMILY",
    "C105 -  FIVE OR MORE FAMILY",
    "C213 - HOTEL/MOTEL",
    "C646 - DEMOLITION 2 FAMILY HOMES",
    "EXTERIOR ACCESSORY APARTMENT",
    "PRE-FABRICATED STRUCTURE",
    "C318 - AMUSEMENT RECREATIONAL",
    "C319 - CHRUCHES/RELIGIOUS",
    "C320 - INDUSTRIAL",
    "C322 - SERVICE STATION/REPAIR",
    "C323 - HOSPITAL/INSTITUTION",
    "C324 - OFFICE/BANK/PROFESSIONAL",
    "C326 - SCHOOL/OTHER EDUCATIONAL",
    "C327 - STORE/CUSTOMER SERVICES",
    "C328 - OTHER NON-RESIDENTIAL",
    "C329 - STRUCTURES OTHER-THAN BUILDINGS",
];

// ============================================================================
// SECTIONS
// ============================================================================

/// Where the spatial data lives and how per-run objects are named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// SQLite database holding the change log and the parcel layers (read only).
    pub source_db: PathBuf,

    /// SQLite database receiving query views, feature sets and the audit trail.
    pub output_db: PathBuf,

    pub change_table: String,
    pub parcel_table: String,

    /// Prefix of the per-run filtered change table (`<prefix><date>`).
    pub view_prefix: String,

    /// Prefix of the per-run parcel feature set (`<prefix><date>`).
    pub feature_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            source_db: PathBuf::from("cvgis.sqlite"),
            output_db: PathBuf::from("planometric_updates/PLANOMETRIC_UPDATES.sqlite"),
            change_table: "Structure_Change".to_string(),
            parcel_table: "parcel_area".to_string(),
            view_prefix: "Structure_Change_Query_".to_string(),
            feature_prefix: "Structure_Change_".to_string(),
        }
    }
}

/// Column names in the change table and the parcel layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub change_parcel_id: String,
    pub change_type: String,
    pub change_demolition: String,
    pub change_authoritative: String,
    pub parcel_id: String,
}

impl Default for FieldConfig {
    fn default() -> Self {
        FieldConfig {
            change_parcel_id: "ParcelNumber".to_string(),
            change_type: "Type".to_string(),
            change_demolition: "isDemolition".to_string(),
            change_authoritative: "IN_SDE".to_string(),
            parcel_id: "PIN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Building types dropped from the change set (exact match after trimming).
    pub excluded_types: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            excluded_types: DEFAULT_EXCLUDED_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// External program that turns a page description into a PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        RendererConfig {
            program: "map-render".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapsConfig {
    pub base_template: PathBuf,
    pub overview_template: PathBuf,
    pub renderer: RendererConfig,
}

impl Default for MapsConfig {
    fn default() -> Self {
        MapsConfig {
            base_template: PathBuf::from("planometric_updates/mxd/Planometric_Update_Basemap.json"),
            overview_template: PathBuf::from("planometric_updates/mxd/Planometric_Updates_Overview.json"),
            renderer: RendererConfig::default(),
        }
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Folder receiving one dated sub-folder per run.
    pub output_root: PathBuf,

    /// Remove the dated folder and per-run tables when a run fails.
    pub cleanup_on_failure: bool,

    pub backend: BackendConfig,
    pub fields: FieldConfig,
    pub filter: FilterConfig,
    pub maps: MapsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_root: PathBuf::from("planometric_updates"),
            cleanup_on_failure: false,
            backend: BackendConfig::default(),
            fields: FieldConfig::default(),
            filter: FilterConfig::default(),
            maps: MapsConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check paths and identifiers, and normalize the excluded types (trimmed).
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let paths: [(&'static str, &Path); 5] = [
            ("output_root", &self.output_root),
            ("backend.source_db", &self.backend.source_db),
            ("backend.output_db", &self.backend.output_db),
            ("maps.base_template", &self.maps.base_template),
            ("maps.overview_template", &self.maps.overview_template),
        ];
        for (option, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath(option));
            }
        }
        if self.maps.renderer.program.trim().is_empty() {
            return Err(ConfigError::EmptyPath("maps.renderer.program"));
        }

        let identifiers: [(&'static str, &str); 9] = [
            ("backend.change_table", &self.backend.change_table),
            ("backend.parcel_table", &self.backend.parcel_table),
            ("backend.view_prefix", &self.backend.view_prefix),
            ("backend.feature_prefix", &self.backend.feature_prefix),
            ("fields.change_parcel_id", &self.fields.change_parcel_id),
            ("fields.change_type", &self.fields.change_type),
            ("fields.change_demolition", &self.fields.change_demolition),
            ("fields.change_authoritative", &self.fields.change_authoritative),
            ("fields.parcel_id", &self.fields.parcel_id),
        ];
        for (option, value) in identifiers {
            if !is_identifier(value) {
                return Err(ConfigError::InvalidIdentifier {
                    option,
                    value: value.to_string(),
                });
            }
        }
        if self.backend.view_prefix == self.backend.feature_prefix {
            return Err(ConfigError::InvalidIdentifier {
                option: "backend.view_prefix",
                value: format!("{} (same as feature_prefix)", self.backend.view_prefix),
            });
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(self.filter.excluded_types.len());
        for raw in &self.filter.excluded_types {
            let entry = raw.trim_matches(' ');
            if entry.is_empty() {
                return Err(ConfigError::InvalidExcludedTypes("blank entry".to_string()));
            }
            if !seen.insert(entry.to_string()) {
                return Err(ConfigError::InvalidExcludedTypes(format!("duplicate entry '{}'", entry)));
            }
            normalized.push(entry.to_string());
        }
        self.filter.excluded_types = normalized;

        Ok(())
    }
}

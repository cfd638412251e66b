// 🏗️ Planometric Update Pipeline
// workspace → change query → parcel ids → parcel selection + join → spreadsheet → maps
//
// Each stage takes the previous stage's output, so the order is fixed by the types.

use crate::audit::{insert_event, RunEvent};
use crate::backend::{JoinSummary, SqliteBackend, OUTPUT_SCHEMA, SOURCE_SCHEMA};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::export::{export_spreadsheet, SpreadsheetArtifact};
use crate::extract::{distinct_parcel_ids, ParcelId, ParcelIdSet};
use crate::manifest::{ArtifactEntry, ArtifactKind, RunCounts, RunManifest};
use crate::map::{CommandExporter, LayerSource, MapDocument};
use crate::query::{Predicate, SqlClause};
use crate::workspace::{RunDate, RunWorkspace};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

// ============================================================================
// PREDICATES
// ============================================================================

/// Pending, non-excluded, non-demolition changes:
/// `auth IS NULL AND NOT (TRIM(type) IN excluded) AND NOT (demolition = 1)`.
pub fn change_filter(config: &Config) -> Predicate {
    let fields = &config.fields;
    Predicate::And(vec![
        Predicate::is_null(&fields.change_authoritative),
        Predicate::not(Predicate::trimmed_in(
            &fields.change_type,
            config.filter.excluded_types.clone(),
        )),
        Predicate::not(Predicate::eq(&fields.change_demolition, 1i64)),
    ])
}

/// Every feature not yet in the authoritative database. Broader than
/// `change_filter` on purpose: type and demolition are ignored.
pub fn overview_filter(config: &Config) -> Predicate {
    Predicate::is_null(&config.fields.change_authoritative)
}

// ============================================================================
// STAGE OUTPUTS
// ============================================================================

/// The persisted result of the change query.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredChangeSet {
    pub table: String,
    pub rows: usize,
}

/// The dated parcel feature set, joined with the change attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelAreaSelection {
    pub feature_set: String,
    pub features: usize,
    pub join: JoinSummary,
    /// Identifiers from the change set with no parcel-area feature.
    pub unmatched: Vec<ParcelId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapArtifacts {
    pub parcel_maps: Vec<(ParcelId, PathBuf)>,
    pub overview: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub date: RunDate,
    pub root: PathBuf,
    pub feature_set: String,
    pub counts: RunCounts,
    pub unmatched: Vec<ParcelId>,
    pub spreadsheet: PathBuf,
    pub parcel_maps: Vec<PathBuf>,
    pub overview_map: PathBuf,
    pub manifest: PathBuf,
}

// ============================================================================
// STAGES
// ============================================================================

/// Check the source tables have every configured field before anything is created.
pub fn preflight(backend: &SqliteBackend, config: &Config) -> Result<SqlClause> {
    let fields = &config.fields;
    backend.require_fields(
        SOURCE_SCHEMA,
        &config.backend.change_table,
        &[
            fields.change_parcel_id.as_str(),
            fields.change_type.as_str(),
            fields.change_demolition.as_str(),
            fields.change_authoritative.as_str(),
        ],
    )?;
    backend.require_fields(SOURCE_SCHEMA, &config.backend.parcel_table, &[fields.parcel_id.as_str()])?;

    Ok(change_filter(config).to_sql())
}

pub fn query_changes(
    backend: &SqliteBackend,
    config: &Config,
    workspace: &RunWorkspace,
    guard: &mut RunGuard<'_>,
) -> Result<FilteredChangeSet> {
    let table = format!("{}{}", config.backend.view_prefix, workspace.date().stamp());
    let rows = backend.make_table_view(&table, &config.backend.change_table, &change_filter(config))?;
    guard.track_table(&table);

    info!(table = %table, rows, "change set filtered");
    Ok(FilteredChangeSet { table, rows })
}

pub fn extract_parcels(backend: &SqliteBackend, config: &Config, changes: &FilteredChangeSet) -> Result<ParcelIdSet> {
    let column = backend.column_values(&changes.table, &config.fields.change_parcel_id)?;
    let ids = distinct_parcel_ids(&column);

    if ids.skipped > 0 {
        warn!(skipped = ids.skipped, "change rows without a parcel identifier ignored");
    }
    info!(parcels = ids.len(), "distinct parcels extracted");
    Ok(ids)
}

/// Select the changed parcels into `<feature_prefix><date>` and join the
/// change attributes onto them. The feature set is tracked by `guard` as soon
/// as it exists.
pub fn select_parcels(
    backend: &SqliteBackend,
    config: &Config,
    workspace: &RunWorkspace,
    changes: &FilteredChangeSet,
    ids: &ParcelIdSet,
    guard: &mut RunGuard<'_>,
) -> Result<ParcelAreaSelection> {
    let feature_set = format!("{}{}", config.backend.feature_prefix, workspace.date().stamp());
    let pin = &config.fields.parcel_id;

    let predicate = if ids.is_empty() {
        info!("no changed parcels; creating an empty feature set");
        Predicate::Always(false)
    } else {
        Predicate::in_list(pin, ids.to_fields())
    };
    let features = backend.select_features(&feature_set, &config.backend.parcel_table, &predicate)?;
    guard.track_table(&feature_set);

    let join = backend.join_field(&feature_set, pin, &changes.table, &config.fields.change_parcel_id)?;
    debug!(added = ?join.added_fields, matched = join.matched, "change attributes joined");

    let unmatched = if ids.is_empty() {
        Vec::new()
    } else {
        let found = distinct_parcel_ids(&backend.column_values(&feature_set, pin)?);
        let missing: Vec<ParcelId> = ids.iter().filter(|id| !found.contains(id)).cloned().collect();
        for id in &missing {
            warn!(pin = %id, "changed parcel not found in parcel layer; dropped from feature set");
        }
        missing
    };

    info!(feature_set = %feature_set, features, unmatched = unmatched.len(), "parcels selected");
    Ok(ParcelAreaSelection { feature_set, features, join, unmatched })
}

fn layer_source(config: &Config, selection: &ParcelAreaSelection) -> LayerSource {
    LayerSource {
        workspace: config.backend.output_db.clone(),
        dataset: selection.feature_set.clone(),
    }
}

/// One PDF per parcel, in sorted identifier order, from a single map document.
pub fn render_parcel_maps(
    map: &mut MapDocument,
    backend: &SqliteBackend,
    config: &Config,
    workspace: &RunWorkspace,
    selection: &ParcelAreaSelection,
    ids: &ParcelIdSet,
) -> Result<Vec<(ParcelId, PathBuf)>> {
    if ids.is_empty() {
        info!("no parcel maps to render");
        return Ok(Vec::new());
    }

    // Sanitized file names must stay unique
    let mut planned = HashSet::new();
    for pin in ids {
        let path = workspace.parcel_pdf_path(pin);
        if !planned.insert(path.clone()) {
            return Err(PipelineError::ArtifactCollision(path));
        }
    }

    map.set_data_source(layer_source(config, selection), backend.read_features(&selection.feature_set)?);

    let mut written = Vec::with_capacity(ids.len());
    for pin in ids {
        let predicate = Predicate::eq(&config.fields.parcel_id, pin.to_field());
        if map.select(&predicate) == 0 {
            warn!(pin = %pin, "parcel has no feature; map shows the whole layer");
        }
        map.zoom_to_selection();
        map.clear_selection();

        let path = map.export_pdf(&workspace.parcel_pdf_path(pin))?;
        debug!(pin = %pin, path = %path.display(), "parcel map exported");
        written.push((pin.clone(), path));
    }

    info!(maps = written.len(), "parcel maps rendered");
    Ok(written)
}

pub fn render_overview(
    map: &mut MapDocument,
    backend: &SqliteBackend,
    config: &Config,
    workspace: &RunWorkspace,
    selection: &ParcelAreaSelection,
) -> Result<PathBuf> {
    map.set_data_source(layer_source(config, selection), backend.read_features(&selection.feature_set)?);

    let pending = map.select(&overview_filter(config));
    let extent = map.zoom_to_selection();
    map.clear_selection();
    let path = map.export_pdf(&workspace.overview_pdf_path())?;

    info!(pending, ?extent, path = %path.display(), "overview map rendered");
    Ok(path)
}

// ============================================================================
// RUN GUARD
// ============================================================================

/// Tracks what a run created. Unless committed, dropping it either removes
/// those objects (`cleanup_on_failure`) or logs each one that was left behind.
pub struct RunGuard<'a> {
    backend: &'a SqliteBackend,
    cleanup: bool,
    run_root: Option<PathBuf>,
    tables: Vec<String>,
    committed: bool,
}

impl<'a> RunGuard<'a> {
    pub fn new(backend: &'a SqliteBackend, cleanup: bool) -> Self {
        RunGuard {
            backend,
            cleanup,
            run_root: None,
            tables: Vec::new(),
            committed: false,
        }
    }

    pub fn track_folder(&mut self, root: PathBuf) {
        self.run_root = Some(root);
    }

    pub fn track_table(&mut self, name: &str) {
        self.tables.push(name.to_string());
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        for table in self.tables.iter().rev() {
            if !self.cleanup {
                warn!(table = %table, "failed run left table in output geodatabase");
                continue;
            }
            match self.backend.drop_table(table) {
                Ok(()) => warn!(table = %table, "removed table from failed run"),
                Err(e) => error!(table = %table, error = %e, "could not remove table from failed run"),
            }
        }

        if let Some(root) = &self.run_root {
            if !self.cleanup {
                warn!(path = %root.display(), "failed run left partial output on disk");
            } else {
                match fs::remove_dir_all(root) {
                    Ok(()) => warn!(path = %root.display(), "removed run folder of failed run"),
                    Err(e) => error!(path = %root.display(), error = %e, "could not remove run folder"),
                }
            }
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: Config,
    backend: SqliteBackend,
    base_map: MapDocument,
    overview_map: MapDocument,
}

impl Pipeline {
    /// Open the backend and both map templates, rendering through the configured program.
    pub fn open(config: Config) -> Result<Self> {
        let backend = SqliteBackend::open(&config.backend)?;
        let base_map = MapDocument::open(
            &config.maps.base_template,
            Box::new(CommandExporter::new(&config.maps.renderer)),
        )?;
        let overview_map = MapDocument::open(
            &config.maps.overview_template,
            Box::new(CommandExporter::new(&config.maps.renderer)),
        )?;
        Ok(Self::new(config, backend, base_map, overview_map))
    }

    pub fn new(config: Config, backend: SqliteBackend, base_map: MapDocument, overview_map: MapDocument) -> Self {
        Pipeline { config, backend, base_map, overview_map }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &SqliteBackend {
        &self.backend
    }

    pub fn preflight(&self) -> Result<SqlClause> {
        preflight(&self.backend, &self.config)
    }

    /// Run every stage for `date`. Any failure aborts the run.
    pub fn run(&mut self, date: RunDate) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let Pipeline { config, backend, base_map, overview_map } = self;
        let backend: &SqliteBackend = backend;

        info!(run_id = %run_id, run_date = %date, "planometric update run starting");
        let mut guard = RunGuard::new(backend, config.cleanup_on_failure);

        let result = execute(&run_id, date, config, backend, base_map, overview_map, &mut guard);
        match result {
            Ok(summary) => {
                guard.commit();
                Ok(summary)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run failed");
                let event = RunEvent::new("run_failed", &run_id, json!({ "error": e.to_string() }));
                if let Err(audit_err) = insert_event(backend.connection(), &event) {
                    error!(error = %audit_err, "could not record run failure");
                }
                drop(guard);
                Err(e)
            }
        }
    }
}

fn record(backend: &SqliteBackend, run_id: &str, event_type: &str, data: serde_json::Value) -> Result<()> {
    insert_event(backend.connection(), &RunEvent::new(event_type, run_id, data))?;
    Ok(())
}

fn execute(
    run_id: &str,
    date: RunDate,
    config: &Config,
    backend: &SqliteBackend,
    base_map: &mut MapDocument,
    overview_map: &mut MapDocument,
    guard: &mut RunGuard<'_>,
) -> Result<RunSummary> {
    let started_at = Utc::now();

    preflight(backend, config)?;

    // 1. Workspace
    let workspace = RunWorkspace::create(&config.output_root, date)?;
    guard.track_folder(workspace.root().to_path_buf());
    record(backend, run_id, "run_started", json!({ "run_date": date.to_string(), "root": workspace.root() }))?;

    // 2. Change query
    let changes = query_changes(backend, config, &workspace, guard)?;
    record(backend, run_id, "changes_filtered", json!({ "table": changes.table, "rows": changes.rows }))?;

    // 3. Parcel extraction & selection
    let ids = extract_parcels(backend, config, &changes)?;
    let selection = select_parcels(backend, config, &workspace, &changes, &ids, guard)?;
    record(
        backend,
        run_id,
        "parcels_selected",
        json!({
            "feature_set": selection.feature_set,
            "parcels": ids.len(),
            "features": selection.features,
            "unmatched": selection.unmatched,
        }),
    )?;
    record(
        backend,
        run_id,
        "join_completed",
        json!({ "added_fields": selection.join.added_fields, "matched": selection.join.matched }),
    )?;

    // 4. Spreadsheet
    let table = backend.read_table(&selection.feature_set)?;
    let SpreadsheetArtifact { path: spreadsheet, rows, .. } = export_spreadsheet(&workspace, &table)?;
    record(backend, run_id, "spreadsheet_exported", json!({ "path": spreadsheet, "rows": rows }))?;

    // 5. Maps
    let parcel_maps = render_parcel_maps(base_map, backend, config, &workspace, &selection, &ids)?;
    for (pin, path) in &parcel_maps {
        record(backend, run_id, "parcel_map_exported", json!({ "pin": pin, "path": path }))?;
    }
    let overview = render_overview(overview_map, backend, config, &workspace, &selection)?;
    record(backend, run_id, "overview_exported", json!({ "path": overview }))?;
    let maps = MapArtifacts { parcel_maps, overview };

    // 6. Manifest
    let counts = RunCounts {
        filtered_changes: changes.rows,
        skipped_changes: ids.skipped,
        distinct_parcels: ids.len(),
        selected_features: selection.features,
        joined_features: selection.join.matched,
        parcel_maps: maps.parcel_maps.len(),
    };

    let root = workspace.root();
    let mut artifacts = vec![ArtifactEntry::from_file(ArtifactKind::Spreadsheet, root, &spreadsheet)?];
    for (_, path) in &maps.parcel_maps {
        artifacts.push(ArtifactEntry::from_file(ArtifactKind::ParcelMap, root, path)?);
    }
    artifacts.push(ArtifactEntry::from_file(ArtifactKind::OverviewMap, root, &maps.overview)?);

    let manifest = RunManifest {
        run_id: run_id.to_string(),
        run_date: date.stamp(),
        started_at,
        finished_at: Utc::now(),
        feature_set: selection.feature_set.clone(),
        counts: counts.clone(),
        unmatched_parcels: selection.unmatched.clone(),
        artifacts,
    };
    let manifest_path = workspace.manifest_path();
    manifest.write(&manifest_path)?;

    record(backend, run_id, "run_completed", json!({ "counts": counts }))?;
    info!(run_id = %run_id, schema = OUTPUT_SCHEMA, feature_set = %selection.feature_set, "run complete");

    Ok(RunSummary {
        run_id: run_id.to_string(),
        date,
        root: root.to_path_buf(),
        feature_set: selection.feature_set,
        counts,
        unmatched: selection.unmatched,
        spreadsheet,
        parcel_maps: maps.parcel_maps.into_iter().map(|(_, p)| p).collect(),
        overview_map: maps.overview,
        manifest: manifest_path,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::get_events_for_run;
    use crate::error::BackendError;
    use crate::backend::tests::{add_change, add_parcel, fixture_backend};
    use crate::map::tests::{recording, template};
    use crate::map::{MapPage, PdfExporter};
    use crate::query::FieldValue;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::rc::Rc;

    fn date() -> RunDate {
        RunDate::from_ymd(2024, 3, 5).unwrap()
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.output_root = root.join("planometric_updates");
        config.backend.output_db = root.join("PLANOMETRIC_UPDATES.sqlite");
        config.validate().unwrap();
        config
    }

    fn pipeline(config: Config, backend: SqliteBackend) -> (Pipeline, Rc<RefCell<Vec<MapPage>>>, Rc<RefCell<Vec<MapPage>>>) {
        let (base_exporter, base_pages) = recording();
        let (overview_exporter, overview_pages) = recording();
        let pipeline = Pipeline::new(
            config,
            backend,
            MapDocument::from_template(template("Basemap"), base_exporter).unwrap(),
            MapDocument::from_template(template("Overview"), overview_exporter).unwrap(),
        );
        (pipeline, base_pages, overview_pages)
    }

    fn pdf_names(summary: &RunSummary) -> BTreeSet<String> {
        fs::read_dir(summary.root.join("pdf"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    fn spreadsheet_lines(summary: &RunSummary) -> Vec<String> {
        fs::read_to_string(&summary.spreadsheet)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_duplicate_pins_give_one_pdf_each() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("GARAGE"), Some(0), None, "P-1");
        add_change(&backend, Some("A2"), Some("ADDITION"), Some(0), None, "P-2");
        add_change(&backend, Some("A1"), Some("DECK"), Some(0), None, "P-3");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));
        add_parcel(&backend, "A2", "JONES", (20.0, 0.0, 30.0, 10.0));
        add_parcel(&backend, "B7", "UNCHANGED", (100.0, 100.0, 110.0, 110.0));

        let (mut pipeline, base_pages, overview_pages) = pipeline(test_config(tmp.path()), backend);
        let summary = pipeline.run(date()).unwrap();

        let expected: BTreeSet<String> =
            ["PIN_A1.pdf", "PIN_A2.pdf", "Overview_Map.pdf"].iter().map(|s| s.to_string()).collect();
        assert_eq!(pdf_names(&summary), expected);
        assert_eq!(summary.counts.filtered_changes, 3);
        assert_eq!(summary.counts.distinct_parcels, 2);
        assert!(summary.unmatched.is_empty());

        // one spreadsheet row per parcel, not per change
        let lines = spreadsheet_lines(&summary);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("PIN\tOwner\t"));
        assert!(lines[1].starts_with("A1\tSMITH\t"));
        assert!(lines[2].starts_with("A2\tJONES\t"));

        // per-parcel maps render in sorted order, zoomed to the parcel
        let pages = base_pages.borrow();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].output.ends_with("PIN_A1.pdf"));
        assert_eq!(pages[0].extent.xmin, 0.0);
        assert_eq!(pages[1].extent.xmin, 20.0);
        assert_eq!(
            pages[0].data_source.as_ref().map(|s| s.dataset.as_str()),
            Some("Structure_Change_2024_03_05")
        );

        // overview covers both pending parcels
        let overview = overview_pages.borrow();
        assert_eq!(overview.len(), 1);
        assert_eq!((overview[0].extent.xmin, overview[0].extent.xmax), (0.0, 30.0));
    }

    #[test]
    fn test_filtered_set_honours_exclusions_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some(" C101 - SINGLE FAMILY DETACHED "), Some(0), None, "P-1");
        add_change(&backend, Some("A2"), Some("C103 -  TWO FAMILY"), Some(0), None, "P-2");
        add_change(&backend, Some("A3"), Some("GARAGE"), Some(1), None, "P-3");
        add_change(&backend, Some("A4"), Some("GARAGE"), Some(0), Some("Y"), "P-4");
        add_change(&backend, Some("A5"), Some("c101 - single family detached"), Some(0), None, "P-5");
        add_change(&backend, Some("A6"), None, Some(0), None, "P-6");
        add_change(&backend, Some("A7"), Some("GARAGE"), None, None, "P-7");
        add_change(&backend, Some("A8"), Some("GARAGE"), Some(0), None, "P-8");

        let workspace = RunWorkspace::plan(&config.output_root, date());
        let mut guard = RunGuard::new(&backend, false);
        let changes = query_changes(&backend, &config, &workspace, &mut guard).unwrap();
        guard.commit();

        let table = backend.read_table(&changes.table).unwrap();
        let records = table.records();
        let pins: Vec<String> = records.iter().map(|r| r["ParcelNumber"].to_string()).collect();
        // NULL type or NULL demolition flag leaves the row out
        assert_eq!(pins, vec!["A5", "A8"]);

        for record in &records {
            assert!(record["IN_SDE"].is_null());
            assert_ne!(record["isDemolition"], FieldValue::Integer(1));
            let ty = record["Type"].to_string();
            assert!(!config.filter.excluded_types.contains(&ty.trim().to_string()));
        }

        // re-applying the predicate to its own output keeps every row
        let predicate = change_filter(&config);
        assert!(records.iter().all(|r| predicate.matches(r)));
    }

    #[test]
    fn test_no_matching_changes_produces_empty_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("C320 - INDUSTRIAL"), Some(0), None, "P-1");
        add_change(&backend, Some("A2"), Some("GARAGE"), Some(1), None, "P-2");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));

        let (mut pipeline, base_pages, overview_pages) = pipeline(test_config(tmp.path()), backend);
        let summary = pipeline.run(date()).unwrap();

        assert_eq!(summary.counts.distinct_parcels, 0);
        assert!(summary.parcel_maps.is_empty());
        assert!(base_pages.borrow().is_empty());
        assert_eq!(overview_pages.borrow().len(), 1);

        let expected: BTreeSet<String> = ["Overview_Map.pdf".to_string()].into_iter().collect();
        assert_eq!(pdf_names(&summary), expected);
        assert_eq!(spreadsheet_lines(&summary).len(), 1);
        assert!(summary.spreadsheet.ends_with("excel/2024_03_05.xls"));
    }

    #[test]
    fn test_unmatched_parcels_are_reported_not_exported() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("GARAGE"), Some(0), None, "P-1");
        add_change(&backend, Some("A9"), Some("GARAGE"), Some(0), None, "P-9");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));

        let (mut pipeline, _, _) = pipeline(test_config(tmp.path()), backend);
        let summary = pipeline.run(date()).unwrap();

        assert_eq!(summary.unmatched, vec![ParcelId::from("A9")]);
        assert_eq!(summary.counts.selected_features, 1);

        // every spreadsheet row is a real parcel
        let lines = spreadsheet_lines(&summary);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("A1\t"));

        // a map is still produced for every changed parcel
        assert!(pdf_names(&summary).contains("PIN_A9.pdf"));

        let manifest = RunManifest::from_file(&summary.manifest).unwrap();
        assert_eq!(manifest.unmatched_parcels, vec![ParcelId::from("A9")]);
        assert_eq!(manifest.artifacts.len(), 4);
    }

    #[test]
    fn test_quotes_in_pins_do_not_break_queries() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("O'NEIL-4"), Some("GARAGE"), Some(0), None, "P-1");
        add_parcel(&backend, "O'NEIL-4", "O'NEIL", (0.0, 0.0, 10.0, 10.0));

        let (mut pipeline, _, _) = pipeline(test_config(tmp.path()), backend);
        let summary = pipeline.run(date()).unwrap();

        assert_eq!(summary.counts.selected_features, 1);
        assert!(pdf_names(&summary).contains("PIN_O_NEIL-4.pdf"));
    }

    #[test]
    fn test_second_run_same_day_is_rejected_and_keeps_first_output() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("GARAGE"), Some(0), None, "P-1");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));

        let mut config = test_config(tmp.path());
        config.cleanup_on_failure = true;
        let (mut pipeline, _, _) = pipeline(config, backend);
        let first = pipeline.run(date()).unwrap();

        let err = pipeline.run(date()).unwrap_err();
        assert!(matches!(err, PipelineError::WorkspaceExists(_)));
        assert!(first.spreadsheet.is_file());
        assert!(pipeline.backend().table_exists(OUTPUT_SCHEMA, &first.feature_set).unwrap());
    }

    struct FailingExporter;

    impl PdfExporter for FailingExporter {
        fn export(&mut self, page: &MapPage) -> Result<()> {
            Err(PipelineError::Render {
                output: page.output.clone(),
                reason: "plotter offline".to_string(),
            })
        }
    }

    fn failing_pipeline(config: Config) -> Pipeline {
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("GARAGE"), Some(0), None, "P-1");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));
        let (overview_exporter, _) = recording();
        Pipeline::new(
            config,
            backend,
            MapDocument::from_template(template("Basemap"), Box::new(FailingExporter)).unwrap(),
            MapDocument::from_template(template("Overview"), overview_exporter).unwrap(),
        )
    }

    #[test]
    fn test_failed_run_cleans_up_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.cleanup_on_failure = true;
        let mut pipeline = failing_pipeline(config);

        let err = pipeline.run(date()).unwrap_err();

        assert!(matches!(err, PipelineError::Render { .. }));
        assert!(!tmp.path().join("planometric_updates/2024_03_05").exists());
        let backend = pipeline.backend();
        assert!(!backend.table_exists(OUTPUT_SCHEMA, "Structure_Change_2024_03_05").unwrap());
        assert!(!backend.table_exists(OUTPUT_SCHEMA, "Structure_Change_Query_2024_03_05").unwrap());
    }

    #[test]
    fn test_failed_run_leaves_partial_output_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pipeline = failing_pipeline(test_config(tmp.path()));

        assert!(pipeline.run(date()).is_err());

        let root = tmp.path().join("planometric_updates/2024_03_05");
        assert!(root.join("excel/2024_03_05.xls").is_file());
        assert!(pipeline.backend().table_exists(OUTPUT_SCHEMA, "Structure_Change_2024_03_05").unwrap());

        let failures: i64 = pipeline
            .backend()
            .connection()
            .query_row("SELECT COUNT(*) FROM run_events WHERE event_type = 'run_failed'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_feature_set_is_removed_when_join_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let backend = fixture_backend();
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));

        let workspace = RunWorkspace::plan(&config.output_root, date());
        let ids = distinct_parcel_ids(&[FieldValue::from("A1")]);
        // join source that was never materialized
        let changes = FilteredChangeSet { table: "Structure_Change_Query_missing".to_string(), rows: 0 };

        let mut guard = RunGuard::new(&backend, true);
        let err = select_parcels(&backend, &config, &workspace, &changes, &ids, &mut guard).unwrap_err();
        assert!(matches!(err, PipelineError::Backend(BackendError::MissingTable { .. })));
        assert!(backend.table_exists(OUTPUT_SCHEMA, "Structure_Change_2024_03_05").unwrap());

        drop(guard);
        assert!(!backend.table_exists(OUTPUT_SCHEMA, "Structure_Change_2024_03_05").unwrap());
    }

    #[test]
    fn test_audit_trail_records_each_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fixture_backend();
        add_change(&backend, Some("A1"), Some("GARAGE"), Some(0), None, "P-1");
        add_change(&backend, Some("A2"), Some("GARAGE"), Some(0), None, "P-2");
        add_parcel(&backend, "A1", "SMITH", (0.0, 0.0, 10.0, 10.0));
        add_parcel(&backend, "A2", "JONES", (20.0, 0.0, 30.0, 10.0));

        let (mut pipeline, _, _) = pipeline(test_config(tmp.path()), backend);
        let summary = pipeline.run(date()).unwrap();

        let events = get_events_for_run(pipeline.backend().connection(), &summary.run_id).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "run_started",
                "changes_filtered",
                "parcels_selected",
                "join_completed",
                "spreadsheet_exported",
                "parcel_map_exported",
                "parcel_map_exported",
                "overview_exported",
                "run_completed",
            ]
        );
    }

    #[test]
    fn test_missing_source_field_fails_before_creating_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.fields.change_demolition = "Demolished".to_string();
        let (mut pipeline, _, _) = pipeline(config, fixture_backend());

        let err = pipeline.run(date()).unwrap_err();

        assert!(matches!(err, PipelineError::Backend(_)));
        assert!(!tmp.path().join("planometric_updates").exists());
    }
}

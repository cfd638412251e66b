// 🗺️ Map Documents - Templates, selections and PDF export
// The document state lives here; drawing the PDF is delegated to a PdfExporter

use crate::backend::Feature;
use crate::config::RendererConfig;
use crate::error::{PipelineError, Result};
use crate::query::Predicate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Name of the data frame every template must have.
pub const DATA_FRAME_NAME: &str = "Layers";

// ============================================================================
// EXTENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    /// `None` unless the corners are finite and ordered.
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Option<Self> {
        let finite = [xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite());
        if finite && xmin <= xmax && ymin <= ymax {
            Some(Extent { xmin, ymin, xmax, ymax })
        } else {
            None
        }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    /// Grow each side by `ratio` of the larger dimension.
    pub fn padded(&self, ratio: f64) -> Extent {
        let pad = self.width().max(self.height()) * ratio;
        Extent {
            xmin: self.xmin - pad,
            ymin: self.ymin - pad,
            xmax: self.xmax + pad,
            ymax: self.ymax + pad,
        }
    }

    pub fn union_all<'a, I: IntoIterator<Item = &'a Extent>>(extents: I) -> Option<Extent> {
        extents.into_iter().fold(None, |acc, e| match acc {
            None => Some(*e),
            Some(a) => Some(a.union(e)),
        })
    }
}

// ============================================================================
// TEMPLATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    /// Dataset the template was authored against; replaced at run time.
    #[serde(default)]
    pub data_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrameSpec {
    pub name: String,
    /// Saved viewport, used when there is nothing to zoom to.
    pub extent: Extent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width_mm: f64,
    pub height_mm: f64,
}

impl Default for PageSize {
    // ANSI B landscape
    fn default() -> Self {
        PageSize { width_mm: 431.8, height_mm: 279.4 }
    }
}

fn default_zoom_margin() -> f64 {
    0.1
}

/// A pre-authored map: one thematic layer, one `Layers` data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTemplate {
    pub name: String,
    pub layers: Vec<LayerSpec>,
    pub data_frames: Vec<DataFrameSpec>,
    #[serde(default)]
    pub page: PageSize,
    #[serde(default = "default_zoom_margin")]
    pub zoom_margin: f64,
}

impl MapTemplate {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let template: MapTemplate = serde_json::from_str(&content)?;
        template.check_layout()?;
        Ok(template)
    }

    pub fn check_layout(&self) -> Result<()> {
        let fail = |reason: String| PipelineError::TemplateLayout {
            template: self.name.clone(),
            reason,
        };

        if self.layers.len() != 1 {
            return Err(fail(format!("expected exactly one layer, found {}", self.layers.len())));
        }
        if !self.data_frames.iter().any(|df| df.name == DATA_FRAME_NAME) {
            return Err(fail(format!("no data frame named '{}'", DATA_FRAME_NAME)));
        }
        if !(self.zoom_margin >= 0.0 && self.zoom_margin.is_finite()) {
            return Err(fail(format!("zoom_margin must be non-negative, got {}", self.zoom_margin)));
        }
        Ok(())
    }

    pub fn layer(&self) -> &LayerSpec {
        &self.layers[0]
    }

    pub fn data_frame(&self) -> &DataFrameSpec {
        // check_layout guarantees presence
        self.data_frames
            .iter()
            .find(|df| df.name == DATA_FRAME_NAME)
            .unwrap_or(&self.data_frames[0])
    }
}

// ============================================================================
// EXPORT
// ============================================================================

/// Where a layer reads its features from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSource {
    pub workspace: PathBuf,
    pub dataset: String,
}

/// Everything a renderer needs to draw one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPage {
    pub template: String,
    pub layer: String,
    pub data_source: Option<LayerSource>,
    pub extent: Extent,
    pub page: PageSize,
    pub output: PathBuf,
}

/// The PDF engine behind a map document.
pub trait PdfExporter {
    fn export(&mut self, page: &MapPage) -> Result<()>;
}

/// Runs an external renderer with the page description as JSON on stdin.
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
}

impl CommandExporter {
    pub fn new(config: &RendererConfig) -> Self {
        CommandExporter {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl PdfExporter for CommandExporter {
    fn export(&mut self, page: &MapPage) -> Result<()> {
        let render_err = |reason: String| PipelineError::Render {
            output: page.output.clone(),
            reason,
        };
        let payload = serde_json::to_vec(page)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| render_err(format!("could not start '{}': {}", self.program, e)))?;

        // The child is always reaped, even if it hung up before reading its input
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&payload),
            None => Ok(()),
        };
        let output = child.wait_with_output()?;

        if let Err(e) = written {
            return Err(render_err(format!(
                "{} exited with {} before reading the page: {}",
                self.program, output.status, e
            )));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(render_err(format!("{} exited with {}: {}", self.program, output.status, stderr.trim())));
        }
        if !page.output.is_file() {
            return Err(render_err("renderer reported success but wrote no file".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// MAP DOCUMENT
// ============================================================================

/// A live map document. Deliberately not `Clone`: one handle per template,
/// used by one run, one call at a time.
pub struct MapDocument {
    template: MapTemplate,
    exporter: Box<dyn PdfExporter>,
    source: Option<LayerSource>,
    features: Vec<Feature>,
    selection: Vec<usize>,
    extent: Extent,
}

impl MapDocument {
    pub fn open<P: AsRef<Path>>(path: P, exporter: Box<dyn PdfExporter>) -> Result<Self> {
        Self::from_template(MapTemplate::from_file(path)?, exporter)
    }

    pub fn from_template(template: MapTemplate, exporter: Box<dyn PdfExporter>) -> Result<Self> {
        template.check_layout()?;
        let extent = template.data_frame().extent;
        Ok(MapDocument {
            template,
            exporter,
            source: None,
            features: Vec::new(),
            selection: Vec::new(),
            extent,
        })
    }

    pub fn template(&self) -> &MapTemplate {
        &self.template
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn data_source(&self) -> Option<&LayerSource> {
        self.source.as_ref()
    }

    pub fn selection_len(&self) -> usize {
        self.selection.len()
    }

    /// Repoint the layer to a new dataset. Drops any selection.
    pub fn set_data_source(&mut self, source: LayerSource, features: Vec<Feature>) {
        debug!(map = %self.template.name, dataset = %source.dataset, features = features.len(), "data source replaced");
        self.source = Some(source);
        self.features = features;
        self.selection.clear();
    }

    /// New selection of the features matching `predicate`. Returns the count.
    pub fn select(&mut self, predicate: &Predicate) -> usize {
        self.selection = self
            .features
            .iter()
            .enumerate()
            .filter(|(_, f)| predicate.matches(&f.attributes))
            .map(|(i, _)| i)
            .collect();
        self.selection.len()
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Fit the viewport to the selection (padded by the template margin).
    /// With nothing selected, fit the whole layer; with an empty layer, keep
    /// the template's saved extent.
    pub fn zoom_to_selection(&mut self) -> Extent {
        let selected = Extent::union_all(
            self.selection
                .iter()
                .filter_map(|&i| self.features[i].extent.as_ref()),
        );
        let target = selected
            .or_else(|| Extent::union_all(self.features.iter().filter_map(|f| f.extent.as_ref())))
            .map(|e| e.padded(self.template.zoom_margin));

        if let Some(extent) = target {
            self.extent = extent;
        }
        self.extent
    }

    /// Export the current view. The `.pdf` extension is added when missing.
    pub fn export_pdf(&mut self, path: &Path) -> Result<PathBuf> {
        let output = if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("pdf")) {
            path.to_path_buf()
        } else {
            path.with_extension("pdf")
        };
        if output.exists() {
            return Err(PipelineError::ArtifactCollision(output));
        }

        let page = MapPage {
            template: self.template.name.clone(),
            layer: self.template.layer().name.clone(),
            data_source: self.source.clone(),
            extent: self.extent,
            page: self.template.page,
            output: output.clone(),
        };
        self.exporter.export(&page)?;
        Ok(output)
    }
}

// ============================================================================
// TESTS
// ============================================================================

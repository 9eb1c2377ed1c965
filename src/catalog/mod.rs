//! Static site catalogs, loaded once at startup and shared immutably.
//!
//! Three lookup tables feed the pipeline: the station table (position,
//! elevation, optional site data), the ordered target list (with the
//! county used for alarm aggregation), and the Vs30 grid served through a
//! nearest-cell query. A failure to load any of them is fatal at startup;
//! a missing station during a later lookup just makes that station absent.

use crate::config::defaults::{SITE_INFO_FILE, TARGET_FILE, VS30_BIN_DEGREES, VS30_GRID_FILE};
use crate::types::{StationMeta, Target};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog file {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("catalog file {path} has no usable rows")]
    Empty { path: String },
}

// ============================================================================
// Station catalog
// ============================================================================

#[derive(Debug, Deserialize)]
struct StationRow {
    station: String,
    latitude: f64,
    longitude: f64,
    elevation_m: f64,
    #[serde(default)]
    vs30: Option<f64>,
    #[serde(default)]
    site_class: Option<String>,
}

/// Station table keyed by station code.
#[derive(Debug, Clone, Default)]
pub struct StationCatalog {
    stations: HashMap<String, StationMeta>,
}

impl StationCatalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| malformed(path, e))?;
        let mut stations = HashMap::new();
        for row in reader.deserialize::<StationRow>() {
            let row = row.map_err(|e| malformed(path, e))?;
            stations.insert(
                row.station,
                StationMeta {
                    latitude: row.latitude,
                    longitude: row.longitude,
                    elevation_m: row.elevation_m,
                    vs30: row.vs30,
                    site_class: row.site_class,
                },
            );
        }
        if stations.is_empty() {
            return Err(CatalogError::Empty {
                path: path.display().to_string(),
            });
        }
        Ok(Self { stations })
    }

    /// Build from in-memory entries (tests, replay harnesses).
    pub fn from_entries(entries: impl IntoIterator<Item = (String, StationMeta)>) -> Self {
        Self {
            stations: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, station: &str) -> Option<&StationMeta> {
        self.stations.get(station)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

// ============================================================================
// Target catalog
// ============================================================================

#[derive(Debug, Deserialize)]
struct TargetRow {
    station: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    vs30: Option<f64>,
    #[serde(default)]
    county: String,
}

/// The fixed, ordered list of prediction targets.
#[derive(Debug, Default)]
pub struct TargetCatalog {
    targets: Vec<Target>,
}

impl TargetCatalog {
    /// Load targets in file order; targets without an explicit Vs30 get a
    /// grid lookup.
    pub fn load(path: &Path, vs30: &Vs30Grid) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| malformed(path, e))?;
        let mut targets = Vec::new();
        for row in reader.deserialize::<TargetRow>() {
            let row = row.map_err(|e| malformed(path, e))?;
            let vs30_value = row
                .vs30
                .unwrap_or_else(|| vs30.lookup(row.latitude, row.longitude));
            targets.push(Target {
                name: row.station,
                latitude: row.latitude,
                longitude: row.longitude,
                vs30: vs30_value,
                county: row.county,
            });
        }
        if targets.is_empty() {
            return Err(CatalogError::Empty {
                path: path.display().to_string(),
            });
        }
        Ok(Self { targets })
    }

    pub fn from_targets(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    /// Targets in configured order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

// ============================================================================
// Vs30 grid
// ============================================================================

#[derive(Debug, Deserialize)]
struct Vs30Row {
    latitude: f64,
    longitude: f64,
    vs30: f64,
}

/// Scattered Vs30 grid points behind a binned nearest-neighbour index.
#[derive(Debug)]
pub struct Vs30Grid {
    points: Vec<(f64, f64, f64)>,
    bins: HashMap<(i32, i32), Vec<usize>>,
    bin_degrees: f64,
}

impl Vs30Grid {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| malformed(path, e))?;
        let mut points = Vec::new();
        for row in reader.deserialize::<Vs30Row>() {
            let row = row.map_err(|e| malformed(path, e))?;
            if row.vs30.is_finite() && row.latitude.is_finite() && row.longitude.is_finite() {
                points.push((row.latitude, row.longitude, row.vs30));
            }
        }
        if points.is_empty() {
            return Err(CatalogError::Empty {
                path: path.display().to_string(),
            });
        }
        Ok(Self::from_points(points))
    }

    pub fn from_points(points: Vec<(f64, f64, f64)>) -> Self {
        let bin_degrees = VS30_BIN_DEGREES;
        let mut bins: HashMap<(i32, i32), Vec<usize>> = HashMap::new();
        for (i, &(lat, lon, _)) in points.iter().enumerate() {
            bins.entry(bin_of(lat, lon, bin_degrees)).or_default().push(i);
        }
        Self {
            points,
            bins,
            bin_degrees,
        }
    }

    /// Vs30 at the nearest grid point, searching outward from the query's
    /// bin ring by ring.
    pub fn lookup(&self, lat: f64, lon: f64) -> f64 {
        let (bx, by) = bin_of(lat, lon, self.bin_degrees);
        let mut best: Option<(f64, f64)> = None;

        for radius in 0..64i32 {
            for dx in -radius..=radius {
                for dy in -radius..=radius {
                    if dx.abs() != radius && dy.abs() != radius {
                        continue;
                    }
                    if let Some(indices) = self.bins.get(&(bx + dx, by + dy)) {
                        for &i in indices {
                            let (plat, plon, value) = self.points[i];
                            let d2 = (plat - lat).powi(2) + (plon - lon).powi(2);
                            if best.map(|(bd, _)| d2 < bd).unwrap_or(true) {
                                best = Some((d2, value));
                            }
                        }
                    }
                }
            }
            // One extra ring after the first hit guards against a closer
            // point sitting just across a bin boundary.
            if let Some((_, value)) = best {
                if radius > 0 {
                    return value;
                }
            }
        }
        // Grid is non-empty, so fall back to a full scan.
        best.map(|(_, v)| v).unwrap_or_else(|| {
            self.points
                .iter()
                .map(|&(plat, plon, v)| ((plat - lat).powi(2) + (plon - lon).powi(2), v))
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, v)| v)
                .unwrap_or(0.0)
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn bin_of(lat: f64, lon: f64, bin_degrees: f64) -> (i32, i32) {
    (
        (lat / bin_degrees).floor() as i32,
        (lon / bin_degrees).floor() as i32,
    )
}

fn malformed(path: &Path, source: csv::Error) -> CatalogError {
    CatalogError::Malformed {
        path: path.display().to_string(),
        source,
    }
}

// ============================================================================
// Combined startup load
// ============================================================================

/// All three catalogs together.
pub struct Catalogs {
    pub stations: StationCatalog,
    pub targets: TargetCatalog,
    pub vs30: Vs30Grid,
}

impl Catalogs {
    /// Load every catalog from the data directory. Any failure is fatal.
    pub fn load(data_dir: &Path) -> Result<Self, CatalogError> {
        let vs30 = Vs30Grid::load(&data_dir.join(VS30_GRID_FILE))?;
        info!(points = vs30.len(), "vs30 grid loaded");

        let stations = StationCatalog::load(&data_dir.join(SITE_INFO_FILE))?;
        info!(stations = stations.len(), "station catalog loaded");

        let targets = TargetCatalog::load(&data_dir.join(TARGET_FILE), &vs30)?;
        info!(targets = targets.len(), "target list loaded");

        Ok(Self {
            stations,
            targets,
            vs30,
        })
    }
}

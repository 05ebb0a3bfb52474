//! Elevation samplers over in-memory geographic grids.
//!
//! Two independent rasters feed the engine: a coarse bare-ground terrain model
//! (horizon profiles) and a fine surface model that includes buildings and
//! trees (near-field checks). Both are loaded from ESRI ASCII grid files whose
//! cell size is given in degrees (north-up, WGS84).

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

/// Mean Earth radius (IUGG), metres.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing header field: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header line '{0}'")]
    InvalidHeader(String),

    #[error("Invalid cell value '{0}'")]
    InvalidValue(String),

    #[error("Expected {expected} cells, found {found}")]
    CellCount { expected: usize, found: usize },
}

/// A point sampler returning ground or surface height in metres, `None` where
/// the source has no coverage.
pub trait ElevationSampler: Send + Sync {
    fn sample(&self, lat: f64, lon: f64) -> Option<f64>;

    /// Identifies the data behind the sampler; profiles built from a
    /// different fingerprint are stale.
    fn fingerprint(&self) -> String;
}

pub type SharedSampler = Arc<dyn ElevationSampler>;

/// Sampler with no coverage anywhere. Used when a raster file is absent, so
/// every dependent result degrades to low-confidence / Unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCoverage;

impl ElevationSampler for NoCoverage {
    fn sample(&self, _lat: f64, _lon: f64) -> Option<f64> {
        None
    }

    fn fingerprint(&self) -> String {
        "none".to_string()
    }
}

/// North-up grid with square geographic cells.
#[derive(Debug, Clone)]
pub struct GridRaster {
    ncols: usize,
    nrows: usize,
    /// Longitude of the west edge.
    west: f64,
    /// Latitude of the south edge.
    south: f64,
    cellsize: f64,
    nodata: Option<f64>,
    /// Row-major, first row is the northernmost.
    values: Vec<f64>,
    fingerprint: String,
}

impl GridRaster {
    /// Load a grid from an `.asc` file.
    pub fn load(path: &Path) -> Result<Self, RasterError> {
        let content = std::fs::read_to_string(path)?;
        let raster = Self::parse_ascii(&content)?;
        tracing::info!(
            "Loaded raster {} ({}x{}, cellsize {}°, fingerprint {})",
            path.display(),
            raster.ncols,
            raster.nrows,
            raster.cellsize,
            raster.fingerprint
        );
        Ok(raster)
    }

    /// Parse ESRI ASCII grid content.
    ///
    /// Header keys are case-insensitive; either `xllcorner`/`yllcorner` or
    /// `xllcenter`/`yllcenter` may be given.
    pub fn parse_ascii(content: &str) -> Result<Self, RasterError> {
        let mut ncols = None;
        let mut nrows = None;
        let mut xll = None;
        let mut yll = None;
        let mut centered = false;
        let mut cellsize = None;
        let mut nodata = None;

        let mut lines = content.lines().peekable();
        while let Some(line) = lines.peek() {
            let trimmed = line.trim();
            let first = trimmed.split_whitespace().next().unwrap_or("");
            if first.is_empty() {
                lines.next();
                continue;
            }
            // Header lines start with a keyword, data lines with a number
            if first.parse::<f64>().is_ok() {
                break;
            }
            let mut parts = trimmed.split_whitespace();
            let key = parts.next().unwrap_or("").to_ascii_lowercase();
            let value = parts
                .next()
                .ok_or_else(|| RasterError::InvalidHeader(trimmed.to_string()))?;
            let number: f64 = value
                .parse()
                .map_err(|_| RasterError::InvalidHeader(trimmed.to_string()))?;
            match key.as_str() {
                "ncols" => ncols = Some(number as usize),
                "nrows" => nrows = Some(number as usize),
                "xllcorner" => xll = Some(number),
                "yllcorner" => yll = Some(number),
                "xllcenter" => {
                    xll = Some(number);
                    centered = true;
                }
                "yllcenter" => {
                    yll = Some(number);
                    centered = true;
                }
                "cellsize" => cellsize = Some(number),
                "nodata_value" => nodata = Some(number),
                _ => return Err(RasterError::InvalidHeader(trimmed.to_string())),
            }
            lines.next();
        }

        let ncols = ncols.ok_or(RasterError::MissingHeader("ncols"))?;
        let nrows = nrows.ok_or(RasterError::MissingHeader("nrows"))?;
        let cellsize = cellsize.ok_or(RasterError::MissingHeader("cellsize"))?;
        let mut west = xll.ok_or(RasterError::MissingHeader("xllcorner"))?;
        let mut south = yll.ok_or(RasterError::MissingHeader("yllcorner"))?;
        if cellsize.is_nan() || cellsize <= 0.0 {
            return Err(RasterError::InvalidHeader(format!("cellsize {}", cellsize)));
        }
        if centered {
            west -= cellsize / 2.0;
            south -= cellsize / 2.0;
        }

        let expected = ncols * nrows;
        let mut values = Vec::with_capacity(expected);
        for token in lines.flat_map(|l| l.split_whitespace()) {
            let v: f64 = token
                .parse()
                .map_err(|_| RasterError::InvalidValue(token.to_string()))?;
            values.push(v);
        }
        if values.len() != expected {
            return Err(RasterError::CellCount {
                expected,
                found: values.len(),
            });
        }

        let fingerprint = grid_fingerprint(ncols, nrows, west, south, cellsize, &values);

        Ok(Self {
            ncols,
            nrows,
            west,
            south,
            cellsize,
            nodata,
            values,
            fingerprint,
        })
    }

    fn cell_index(&self, lat: f64, lon: f64) -> Option<usize> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let col = ((lon - self.west) / self.cellsize).floor();
        let row_from_south = ((lat - self.south) / self.cellsize).floor();
        if col < 0.0 || row_from_south < 0.0 {
            return None;
        }
        let (col, row_from_south) = (col as usize, row_from_south as usize);
        if col >= self.ncols || row_from_south >= self.nrows {
            return None;
        }
        let row = self.nrows - 1 - row_from_south;
        Some(row * self.ncols + col)
    }
}

impl ElevationSampler for GridRaster {
    fn sample(&self, lat: f64, lon: f64) -> Option<f64> {
        let v = self.values[self.cell_index(lat, lon)?];
        match self.nodata {
            Some(nd) if v == nd => None,
            _ if !v.is_finite() => None,
            _ => Some(v),
        }
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }
}

fn grid_fingerprint(
    ncols: usize,
    nrows: usize,
    west: f64,
    south: f64,
    cellsize: f64,
    values: &[f64],
) -> String {
    let mut hasher = DefaultHasher::new();
    ncols.hash(&mut hasher);
    nrows.hash(&mut hasher);
    west.to_bits().hash(&mut hasher);
    south.to_bits().hash(&mut hasher);
    cellsize.to_bits().hash(&mut hasher);
    for v in values {
        v.to_bits().hash(&mut hasher);
    }
    format!("grid-{}x{}-{:016x}", ncols, nrows, hasher.finish())
}

/// Load a raster, falling back to [`NoCoverage`] when the file is missing or
/// invalid.
pub fn load_or_empty(path: &Path) -> SharedSampler {
    match GridRaster::load(path) {
        Ok(raster) => Arc::new(raster),
        Err(e) => {
            tracing::error!(
                "Failed to load raster {}: {}. Samples will report no data",
                path.display(),
                e
            );
            Arc::new(NoCoverage)
        }
    }
}

/// Point at `distance_m` along `bearing_deg` (clockwise from north) from
/// (lat, lon), using a local tangent-plane offset. Accurate to well below a
/// metre within 10 km.
pub fn destination_point(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let bearing = bearing_deg.to_radians();
    let north_m = distance_m * bearing.cos();
    let east_m = distance_m * bearing.sin();
    let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
    let dlon = (east_m / (EARTH_RADIUS_M * lat.to_radians().cos())).to_degrees();
    (lat + dlat, lon + dlon)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic samplers shared by the engine tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sampler defined by a closure over (lat, lon).
    pub struct FnSampler<F>(pub F);

    impl<F> ElevationSampler for FnSampler<F>
    where
        F: Fn(f64, f64) -> Option<f64> + Send + Sync,
    {
        fn sample(&self, lat: f64, lon: f64) -> Option<f64> {
            (self.0)(lat, lon)
        }

        fn fingerprint(&self) -> String {
            "fn".to_string()
        }
    }

    /// Flat surface at a fixed height.
    pub fn flat(height: f64) -> FnSampler<impl Fn(f64, f64) -> Option<f64> + Send + Sync> {
        FnSampler(move |_, _| Some(height))
    }

    /// Wraps a sampler and counts every call.
    pub struct CountingSampler<S> {
        pub inner: S,
        pub calls: AtomicUsize,
    }

    impl<S> CountingSampler<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl<S: ElevationSampler> ElevationSampler for CountingSampler<S> {
        fn sample(&self, lat: f64, lon: f64) -> Option<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.sample(lat, lon)
        }

        fn fingerprint(&self) -> String {
            self.inner.fingerprint()
        }
    }

    /// Horizontal distance in metres between two nearby points (inverse of
    /// [`destination_point`]).
    pub fn local_distance_m(lat0: f64, lon0: f64, lat: f64, lon: f64) -> f64 {
        let north = (lat - lat0).to_radians() * EARTH_RADIUS_M;
        let east = (lon - lon0).to_radians() * EARTH_RADIUS_M * lat0.to_radians().cos();
        (north * north + east * east).sqrt()
    }
}

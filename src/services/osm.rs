//! OpenStreetMap XML import for bench locations.
//!
//! Reads `<node>` elements tagged `amenity=bench` from `.osm` exports:
//! - Identity and coordinates from the `id`, `lat` and `lon` attributes
//! - Optional `name` and `ele` tags
//!
//! Ground elevation is resolved against the terrain raster at import time.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

use crate::services::raster::ElevationSampler;

/// Errors that can occur while reading OSM exports.
#[derive(Debug, Error)]
pub enum OsmError {
    #[error("IO error reading OSM file: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// A bench node parsed from an OSM export.
#[derive(Debug, Clone, PartialEq)]
pub struct OsmBench {
    pub osm_id: i64,
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    /// Elevation in metres from the `ele` tag, if mapped.
    pub ele: Option<f64>,
}

/// A bench ready to be upserted into the location catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedLocation {
    pub osm_id: i64,
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub ground_elevation_m: f64,
    pub observer_height_m: f64,
}

/// Parse an OSM file from disk.
pub fn parse_osm_file(path: &Path) -> Result<Vec<OsmBench>, OsmError> {
    let xml = std::fs::read_to_string(path)?;
    parse_osm(&xml)
}

#[derive(Default)]
struct NodeState {
    id: Option<i64>,
    lat: Option<f64>,
    lon: Option<f64>,
    name: Option<String>,
    ele: Option<String>,
    is_bench: bool,
}

/// Parse OSM XML and return every `amenity=bench` node.
///
/// Nodes with a missing or malformed id or coordinate are skipped with a
/// warning; ways and relations are ignored.
pub fn parse_osm(xml: &str) -> Result<Vec<OsmBench>, OsmError> {
    let mut reader = Reader::from_str(xml);
    let mut benches = Vec::new();
    let mut node: Option<NodeState> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"node" => {
                node = Some(read_node_attributes(e));
            }
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"tag" => {
                if let Some(state) = node.as_mut() {
                    let (k, v) = read_tag(e);
                    match (k.as_deref(), v) {
                        (Some("amenity"), Some(v)) => state.is_bench = v == "bench",
                        (Some("name"), Some(v)) => state.name = Some(v),
                        (Some("ele"), Some(v)) => state.ele = Some(v),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"node" => {
                if let Some(state) = node.take() {
                    if let Some(bench) = finish_node(state) {
                        benches.push(bench);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OsmError::Xml(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(benches)
}

fn read_node_attributes(e: &BytesStart) -> NodeState {
    let mut state = NodeState::default();
    for attr in e.attributes().flatten() {
        let val = std::str::from_utf8(&attr.value).unwrap_or("");
        match attr.key.as_ref() {
            b"id" => state.id = val.parse().ok(),
            b"lat" => state.lat = val.parse().ok(),
            b"lon" => state.lon = val.parse().ok(),
            _ => {}
        }
    }
    state
}

fn read_tag(e: &BytesStart) -> (Option<String>, Option<String>) {
    let mut k = None;
    let mut v = None;
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().ok().map(|s| s.trim().to_string());
        match attr.key.as_ref() {
            b"k" => k = value,
            b"v" => v = value,
            _ => {}
        }
    }
    (k, v)
}

fn finish_node(state: NodeState) -> Option<OsmBench> {
    if !state.is_bench {
        return None;
    }
    let (Some(osm_id), Some(lat), Some(lon)) = (state.id, state.lat, state.lon) else {
        tracing::warn!(
            "Skipping bench node with missing or malformed id/lat/lon (id={:?})",
            state.id
        );
        return None;
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        tracing::warn!("Skipping bench node {} with out-of-range coordinates", osm_id);
        return None;
    }
    let ele = state.ele.as_deref().and_then(parse_ele);
    Some(OsmBench {
        osm_id,
        name: state.name.filter(|n| !n.is_empty()),
        lat,
        lon,
        ele,
    })
}

/// `ele` is free text in OSM; accept "352", "352.5" and "352 m".
fn parse_ele(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches('m').trim();
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            tracing::warn!("Ignoring unparseable ele tag '{}'", raw);
            None
        }
    }
}

/// Resolve ground and observer height for a bench. Terrain wins over the
/// `ele` tag; `None` when neither is available.
pub fn resolve_location(
    bench: &OsmBench,
    terrain: &dyn ElevationSampler,
    observer_offset_m: f64,
) -> Option<ImportedLocation> {
    let ground = match terrain.sample(bench.lat, bench.lon).or(bench.ele) {
        Some(g) => g,
        None => {
            tracing::warn!(
                "Skipping bench {} ({:?}): no terrain coverage and no ele tag",
                bench.osm_id,
                bench.name
            );
            return None;
        }
    };
    Some(ImportedLocation {
        osm_id: bench.osm_id,
        name: bench.name.clone(),
        lat: bench.lat,
        lon: bench.lon,
        ground_elevation_m: ground,
        observer_height_m: ground + observer_offset_m,
    })
}

/// Scan a directory for `*.osm` files and parse each one.
pub fn load_benches_from_dir(dir: &Path) -> Result<Vec<OsmBench>, OsmError> {
    let mut benches = Vec::new();
    if !dir.exists() {
        tracing::warn!("Data directory does not exist: {}", dir.display());
        return Ok(benches);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "osm") {
            tracing::info!("Loading benches from OSM export: {}", path.display());
            match parse_osm_file(&path) {
                Ok(found) => {
                    tracing::info!("  Parsed {} benches", found.len());
                    benches.extend(found);
                }
                Err(e) => {
                    tracing::error!("  Failed to parse {}: {}", path.display(), e);
                }
            }
        }
    }
    Ok(benches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::raster::testing::flat;
    use crate::services::raster::NoCoverage;

    const SAMPLE_OSM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="overpass">
  <node id="1001" lat="47.0763" lon="15.4375">
    <tag k="amenity" v="bench"/>
    <tag k="name" v="Schlossberg &amp; Uhrturm"/>
    <tag k="ele" v="473 m"/>
  </node>
  <node id="1002" lat="47.0700" lon="15.4400">
    <tag k="amenity" v="bench"/>
    <tag k="backrest" v="yes"/>
  </node>
  <node id="1003" lat="47.0710" lon="15.4410">
    <tag k="amenity" v="waste_basket"/>
  </node>
  <node id="1004" lat="47.0720" lon="15.4420"/>
  <node id="1005" lat="not-a-number" lon="15.4420">
    <tag k="amenity" v="bench"/>
  </node>
  <way id="2001">
    <nd ref="1001"/>
    <tag k="amenity" v="bench"/>
  </way>
</osm>"#;

    #[test]
    fn test_parse_benches() {
        let benches = parse_osm(SAMPLE_OSM).unwrap();
        assert_eq!(benches.len(), 2);
        assert_eq!(benches[0].osm_id, 1001);
        assert_eq!(benches[0].name.as_deref(), Some("Schlossberg & Uhrturm"));
        assert_eq!(benches[0].ele, Some(473.0));
        assert_eq!(benches[0].lat, 47.0763);
        assert_eq!(benches[1].osm_id, 1002);
        assert_eq!(benches[1].name, None);
        assert_eq!(benches[1].ele, None);
    }

    #[test]
    fn test_non_bench_and_malformed_nodes_skipped() {
        let benches = parse_osm(SAMPLE_OSM).unwrap();
        assert!(!benches.iter().any(|b| b.osm_id == 1003));
        assert!(!benches.iter().any(|b| b.osm_id == 1004));
        assert!(!benches.iter().any(|b| b.osm_id == 1005));
    }

    #[test]
    fn test_malformed_xml_errors() {
        assert!(parse_osm("<osm><node id=\"1\"></osm>").is_err());
    }

    #[test]
    fn test_parse_ele() {
        assert_eq!(parse_ele("352"), Some(352.0));
        assert_eq!(parse_ele(" 352.5 m "), Some(352.5));
        assert_eq!(parse_ele("high"), None);
    }

    fn bench(ele: Option<f64>) -> OsmBench {
        OsmBench {
            osm_id: 1,
            name: Some("Murufer".into()),
            lat: 47.07,
            lon: 15.43,
            ele,
        }
    }

    #[test]
    fn test_resolve_prefers_terrain() {
        let loc = resolve_location(&bench(Some(400.0)), &flat(353.2), 1.2).unwrap();
        assert_eq!(loc.ground_elevation_m, 353.2);
        assert!((loc.observer_height_m - 354.4).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_falls_back_to_ele_tag() {
        let loc = resolve_location(&bench(Some(400.0)), &NoCoverage, 1.2).unwrap();
        assert_eq!(loc.ground_elevation_m, 400.0);
        assert!((loc.observer_height_m - 401.2).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_without_any_elevation_skips() {
        assert!(resolve_location(&bench(None), &NoCoverage, 1.2).is_none());
    }

    #[test]
    fn test_load_from_missing_dir_is_empty() {
        let benches = load_benches_from_dir(Path::new("/nonexistent/osm/dir")).unwrap();
        assert!(benches.is_empty());
    }

    #[test]
    fn test_load_from_dir_reads_only_osm_files() {
        let dir = std::env::temp_dir().join(format!("osm-import-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("graz.osm"), SAMPLE_OSM).unwrap();
        std::fs::write(dir.join("notes.txt"), "not xml").unwrap();
        let benches = load_benches_from_dir(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(benches.len(), 2);
    }
}

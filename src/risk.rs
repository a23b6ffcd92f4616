//! Risk-area geofencing over static GeoJSON datasets.
//!
//! Datasets load once at startup into an immutable index and are queried in
//! a fixed priority order (municipal survey before federal): the first
//! containing feature of the first matching dataset wins, overlapping zones
//! are never blended.

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::config::RiskDatasetRef;
use crate::error::SyncError;
use crate::payload::RiskTag;

static NAME_KEYS: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["Name", "NOME", "bairro"]);
static RISK_LEVEL_KEYS: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["Risco", "GRAU_RISCO"]);
static DESCRIPTION_KEYS: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["description", "OBSERVACAO"]);

const UNKNOWN_AREA: &str = "Área de Risco Desconhecida";
const UNKNOWN_RISK_LEVEL: &str = "Não informado";

type Ring = Vec<(f64, f64)>;

#[derive(Debug, Clone)]
enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

/// One loaded polygon feature with the attributes surfaced to captured
/// records. The full properties map is kept for report generators.
#[derive(Debug, Clone)]
pub struct RiskFeature {
    pub source: String,
    pub name: String,
    pub risk_level: String,
    pub description: String,
    pub properties: Map<String, Value>,
    geometry: Geometry,
}

impl RiskFeature {
    pub fn tag(&self) -> RiskTag {
        RiskTag {
            source: self.source.clone(),
            name: self.name.clone(),
            risk_level: self.risk_level.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug)]
struct Dataset {
    name: String,
    features: Vec<RiskFeature>,
}

/// Point-containment index over all configured risk datasets.
#[derive(Debug, Default)]
pub struct RiskAreaIndex {
    datasets: Vec<Dataset>,
}

#[derive(Deserialize)]
struct FeatureCollectionDoc {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    features: Vec<FeatureDoc>,
}

#[derive(Deserialize)]
struct FeatureDoc {
    #[serde(default)]
    geometry: Option<Value>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

impl RiskAreaIndex {
    /// Load datasets from config-listed files, in priority order.
    pub fn load_from_files(refs: &[RiskDatasetRef]) -> Result<Self, SyncError> {
        let mut index = RiskAreaIndex::default();
        for r in refs {
            let content = std::fs::read_to_string(Path::new(&r.path)).map_err(|e| {
                SyncError::DataFormat {
                    source_name: r.name.clone(),
                    reason: format!("cannot read {}: {}", r.path, e),
                }
            })?;
            let doc: Value =
                serde_json::from_str(&content).map_err(|e| SyncError::DataFormat {
                    source_name: r.name.clone(),
                    reason: format!("invalid JSON: {}", e),
                })?;
            index.push_dataset(&r.name, doc)?;
        }
        Ok(index)
    }

    /// Load datasets from already-parsed GeoJSON values, in priority order.
    pub fn load(datasets: Vec<(String, Value)>) -> Result<Self, SyncError> {
        let mut index = RiskAreaIndex::default();
        for (name, doc) in datasets {
            index.push_dataset(&name, doc)?;
        }
        Ok(index)
    }

    fn push_dataset(&mut self, source_name: &str, doc: Value) -> Result<(), SyncError> {
        let collection: FeatureCollectionDoc =
            serde_json::from_value(doc).map_err(|e| SyncError::DataFormat {
                source_name: source_name.to_string(),
                reason: format!("not a FeatureCollection: {}", e),
            })?;
        if collection.kind != "FeatureCollection" {
            return Err(SyncError::DataFormat {
                source_name: source_name.to_string(),
                reason: format!("unexpected type {:?}", collection.kind),
            });
        }

        let total = collection.features.len();
        let mut features = Vec::with_capacity(total);
        let mut skipped = 0usize;
        for (i, feature) in collection.features.into_iter().enumerate() {
            match parse_geometry(feature.geometry.as_ref()) {
                Some(geometry) => {
                    let properties = feature.properties.unwrap_or_default();
                    features.push(RiskFeature {
                        source: source_name.to_string(),
                        name: first_string(&properties, &NAME_KEYS)
                            .unwrap_or_else(|| UNKNOWN_AREA.to_string()),
                        risk_level: first_string(&properties, &RISK_LEVEL_KEYS)
                            .unwrap_or_else(|| UNKNOWN_RISK_LEVEL.to_string()),
                        description: first_string(&properties, &DESCRIPTION_KEYS)
                            .unwrap_or_default(),
                        properties,
                        geometry,
                    });
                }
                None => {
                    skipped += 1;
                    warn!(source = source_name, index = i, "skipping feature with missing or malformed geometry");
                }
            }
        }
        info!(
            source = source_name,
            loaded = features.len(),
            skipped,
            "risk dataset loaded"
        );
        self.datasets.push(Dataset {
            name: source_name.to_string(),
            features,
        });
        Ok(())
    }

    /// Find the risk area containing the point, honoring dataset priority.
    /// Out-of-range or non-finite coordinates return None without error.
    pub fn query(&self, latitude: f64, longitude: f64) -> Option<&RiskFeature> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        for dataset in &self.datasets {
            for feature in &dataset.features {
                if contains(&feature.geometry, longitude, latitude) {
                    return Some(feature);
                }
            }
        }
        None
    }

    /// Capture-time convenience: the annotation embedded into a record.
    pub fn tag(&self, latitude: f64, longitude: f64) -> Option<RiskTag> {
        self.query(latitude, longitude).map(RiskFeature::tag)
    }

    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn feature_count(&self) -> usize {
        self.datasets.iter().map(|d| d.features.len()).sum()
    }
}

fn first_string(properties: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match properties.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Parse a GeoJSON geometry object into rings. Anything other than a
/// well-formed Polygon/MultiPolygon yields None so the caller can skip the
/// feature instead of aborting the dataset.
fn parse_geometry(value: Option<&Value>) -> Option<Geometry> {
    let value = value?;
    let kind = value.get("type")?.as_str()?;
    let coordinates = value.get("coordinates")?;
    match kind {
        "Polygon" => parse_rings(coordinates).map(Geometry::Polygon),
        "MultiPolygon" => {
            let polygons = coordinates
                .as_array()?
                .iter()
                .map(parse_rings)
                .collect::<Option<Vec<_>>>()?;
            if polygons.is_empty() {
                return None;
            }
            Some(Geometry::MultiPolygon(polygons))
        }
        _ => None,
    }
}

fn parse_rings(coordinates: &Value) -> Option<Vec<Ring>> {
    let rings = coordinates
        .as_array()?
        .iter()
        .map(parse_ring)
        .collect::<Option<Vec<_>>>()?;
    if rings.is_empty() {
        return None;
    }
    Some(rings)
}

fn parse_ring(ring: &Value) -> Option<Ring> {
    let positions = ring.as_array()?;
    // A linear ring needs at least a triangle plus the closing position.
    if positions.len() < 4 {
        return None;
    }
    positions
        .iter()
        .map(|pos| {
            let pos = pos.as_array()?;
            // GeoJSON order is [lon, lat], optionally followed by altitude.
            let lon = pos.first()?.as_f64()?;
            let lat = pos.get(1)?.as_f64()?;
            Some((lon, lat))
        })
        .collect()
}

fn contains(geometry: &Geometry, lon: f64, lat: f64) -> bool {
    match geometry {
        Geometry::Polygon(rings) => polygon_contains(rings, lon, lat),
        Geometry::MultiPolygon(polygons) => polygons
            .iter()
            .any(|rings| polygon_contains(rings, lon, lat)),
    }
}

/// Inside the outer ring and not inside any hole.
fn polygon_contains(rings: &[Ring], lon: f64, lat: f64) -> bool {
    let Some(outer) = rings.first() else {
        return false;
    };
    if !point_in_ring(outer, lon, lat) {
        return false;
    }
    !rings[1..].iter().any(|hole| point_in_ring(hole, lon, lat))
}

/// Even-odd ray casting against one linear ring.
fn point_in_ring(ring: &[(f64, f64)], lon: f64, lat: f64) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

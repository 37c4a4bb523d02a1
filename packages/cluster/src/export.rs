//! `GeoJSON` and KML export of cluster boundaries for mapping tools.
//!
//! Each cluster contributes a `Polygon` feature for its convex hull (when
//! the hull has at least three vertices) and a `Point` feature for its
//! center. Coordinates are `[longitude, latitude]`.

use std::io::Write as _;
use std::path::Path;

use camsite_cluster_models::{Cluster, ClusterBoundary};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};

use crate::boundary::clusters_with_boundaries;
use crate::{ClusterError, ClusterStore};

/// Errors that can occur while exporting.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Reading clusters failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The output file could not be written.
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The feature collection could not be serialized.
    #[error("Export serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A cluster and its boundary, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFeature {
    /// The cluster.
    pub cluster: Cluster,
    /// Its boundary geometry.
    pub boundary: ClusterBoundary,
}

/// Every cluster with its boundary, in store order, from one snapshot.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read.
pub fn cluster_features(store: &ClusterStore) -> Result<Vec<ClusterFeature>, ClusterError> {
    let pairs = store.read(clusters_with_boundaries)?;
    Ok(pairs
        .into_iter()
        .map(|(cluster, boundary)| ClusterFeature { cluster, boundary })
        .collect())
}

fn properties(value: serde_json::Value) -> Option<JsonObject> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

fn hull_feature(feature: &ClusterFeature) -> Option<Feature> {
    let hull = &feature.boundary.convex_hull;
    if hull.len() < 3 {
        return None;
    }

    let ring: geo::LineString<f64> = hull
        .iter()
        .map(|p| geo::coord! { x: p.longitude, y: p.latitude })
        .collect();
    // `Polygon::new` closes the ring.
    let polygon = geo::Polygon::new(ring, vec![]);

    Some(Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&polygon))),
        id: None,
        properties: properties(serde_json::json!({
            "cluster_id": feature.cluster.cluster_id,
            "name": feature.cluster.name,
            "point_count": feature.cluster.point_count,
            "is_named": feature.cluster.is_named,
            "area_square_meters": feature.boundary.area_square_meters,
            "perimeter_meters": feature.boundary.perimeter_meters,
        })),
        foreign_members: None,
    })
}

fn center_feature(feature: &ClusterFeature) -> Feature {
    let center = feature.boundary.center;
    let point = geo::Point::new(center.longitude, center.latitude);

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&point))),
        id: None,
        properties: properties(serde_json::json!({
            "cluster_id": feature.cluster.cluster_id,
            "name": feature.cluster.name,
            "type": "center",
            "point_count": feature.cluster.point_count,
            "is_named": feature.cluster.is_named,
        })),
        foreign_members: None,
    }
}

/// Renders clusters as a `FeatureCollection`.
#[must_use]
pub fn to_feature_collection(features: &[ClusterFeature]) -> FeatureCollection {
    let features = features
        .iter()
        .flat_map(|feature| hull_feature(feature).into_iter().chain([center_feature(feature)]))
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// Writes every cluster in the store to `output_path` as pretty-printed
/// `GeoJSON`. Returns the number of features written.
///
/// # Errors
///
/// Returns [`ExportError`] if the store cannot be read or the file cannot
/// be written.
pub fn write_geojson(store: &ClusterStore, output_path: &Path) -> Result<usize, ExportError> {
    let collection = to_feature_collection(&cluster_features(store)?);

    let file = std::fs::File::create(output_path)?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &collection)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let count = collection.features.len();
    log::info!("Exported {count} features to {}", output_path.display());
    Ok(count)
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn display_name(cluster: &Cluster) -> String {
    cluster.name.clone().unwrap_or_else(|| {
        let short: String = cluster.cluster_id.chars().take(8).collect();
        format!("Cluster {short}")
    })
}

/// Renders clusters as a KML document: a center placemark per cluster and
/// a boundary placemark for every hull with at least three vertices.
#[must_use]
pub fn to_kml(features: &[ClusterFeature]) -> String {
    let mut kml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <kml xmlns=\"http://www.opengis.net/kml/2.2\">\n\
         <Document>\n\
         <name>Camera Site Clusters</name>\n",
    );

    for feature in features {
        let cluster = &feature.cluster;
        let name = escape_xml(&display_name(cluster));
        let id = escape_xml(&cluster.cluster_id);
        let center = feature.boundary.center;

        kml.push_str(&format!(
            "<Placemark>\n\
             <name>{name} (Center)</name>\n\
             <description>Cluster {id} - {} points</description>\n\
             <Point><coordinates>{},{},0</coordinates></Point>\n\
             </Placemark>\n",
            cluster.point_count, center.longitude, center.latitude,
        ));

        let hull = &feature.boundary.convex_hull;
        if hull.len() < 3 {
            continue;
        }

        let ring: Vec<String> = hull
            .iter()
            .chain(hull.first())
            .map(|p| format!("{},{},0", p.longitude, p.latitude))
            .collect();

        kml.push_str(&format!(
            "<Placemark>\n\
             <name>{name} (Boundary)</name>\n\
             <description>Cluster {id} boundary</description>\n\
             <Polygon><outerBoundaryIs><LinearRing>\n\
             <coordinates>{}</coordinates>\n\
             </LinearRing></outerBoundaryIs></Polygon>\n\
             </Placemark>\n",
            ring.join(" "),
        ));
    }

    kml.push_str("</Document>\n</kml>\n");
    kml
}

/// Writes every cluster in the store to `output_path` as KML. Returns the
/// number of placemarks written.
///
/// # Errors
///
/// Returns [`ExportError`] if the store cannot be read or the file cannot
/// be written.
pub fn write_kml(store: &ClusterStore, output_path: &Path) -> Result<usize, ExportError> {
    let features = cluster_features(store)?;
    let count: usize = features
        .iter()
        .map(|f| if f.boundary.convex_hull.len() >= 3 { 2 } else { 1 })
        .sum();

    std::fs::write(output_path, to_kml(&features))?;

    log::info!("Exported {count} placemarks to {}", output_path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::assign_observation;
    use crate::test_support::{meters_north, obs, store};

    #[test]
    fn single_point_cluster_exports_center_only() {
        let store = store();
        assign_observation(&store, 5.0, &obs("a", 59.0, 10.0)).unwrap();

        let collection = to_feature_collection(&cluster_features(&store).unwrap());
        assert_eq!(collection.features.len(), 1);

        let value = serde_json::to_value(&collection).unwrap();
        let feature = &value["features"][0];
        assert_eq!(feature["geometry"]["type"], "Point");
        assert_eq!(feature["geometry"]["coordinates"], serde_json::json!([10.0, 59.0]));
        assert_eq!(feature["properties"]["type"], "center");
        assert_eq!(feature["properties"]["point_count"], 1);
        assert_eq!(feature["properties"]["is_named"], false);
    }

    #[test]
    fn triangle_cluster_exports_closed_polygon() {
        let store = store();
        let cluster_id = assign_observation(&store, 5.0, &obs("a", 59.0, 10.0))
            .unwrap()
            .assignment()
            .cluster_id
            .clone();
        assign_observation(&store, 5.0, &obs("b", 59.0 + meters_north(2.0), 10.0)).unwrap();
        assign_observation(&store, 5.0, &obs("c", 59.0, 10.00003)).unwrap();
        store.rename(&cluster_id, "Feeder", None).unwrap();

        let collection = to_feature_collection(&cluster_features(&store).unwrap());
        assert_eq!(collection.features.len(), 2);

        let value = serde_json::to_value(&collection).unwrap();
        let polygon = &value["features"][0];
        assert_eq!(polygon["geometry"]["type"], "Polygon");
        assert_eq!(polygon["properties"]["name"], "Feeder");
        assert!(polygon["properties"]["area_square_meters"].as_f64().unwrap() > 0.0);

        let ring = polygon["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.first(), ring.last());

        assert_eq!(value["features"][1]["geometry"]["type"], "Point");
    }

    #[test]
    fn writes_file() {
        let store = store();
        assign_observation(&store, 5.0, &obs("a", 59.0, 10.0)).unwrap();
        assign_observation(&store, 5.0, &obs("b", 60.0, 10.0)).unwrap();

        let path = std::env::temp_dir().join(format!("camsite-{}.geojson", uuid::Uuid::new_v4()));
        let count = write_geojson(&store, &path).unwrap();
        assert_eq!(count, 2);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["type"], "FeatureCollection");
        assert_eq!(written["features"].as_array().unwrap().len(), 2);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn kml_has_center_and_closed_boundary() {
        let store = store();
        let cluster_id = assign_observation(&store, 5.0, &obs("a", 59.0, 10.0))
            .unwrap()
            .assignment()
            .cluster_id
            .clone();
        assign_observation(&store, 5.0, &obs("b", 59.0 + meters_north(2.0), 10.0)).unwrap();
        assign_observation(&store, 5.0, &obs("c", 59.0, 10.00003)).unwrap();
        store.rename(&cluster_id, "Fox & Badger <den>", None).unwrap();
        assign_observation(&store, 5.0, &obs("far", 60.0, 11.0)).unwrap();

        let kml = to_kml(&cluster_features(&store).unwrap());
        assert!(kml.starts_with("<?xml"));
        assert!(kml.trim_end().ends_with("</kml>"));
        assert_eq!(kml.matches("<Placemark>").count(), 3);
        assert!(kml.contains("<name>Fox &amp; Badger &lt;den&gt; (Boundary)</name>"));
        assert!(kml.contains("<coordinates>11,60,0</coordinates>"));

        let unnamed: String = kml
            .lines()
            .filter(|line| line.starts_with("<name>Cluster "))
            .collect();
        assert!(unnamed.contains("(Center)"));

        let ring_line = kml
            .lines()
            .find(|line| line.starts_with("<coordinates>") && line.contains(' '))
            .unwrap();
        let ring: Vec<&str> = ring_line
            .trim_start_matches("<coordinates>")
            .trim_end_matches("</coordinates>")
            .split(' ')
            .collect();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.first(), ring.last());
    }

    #[test]
    fn writes_kml_file() {
        let store = store();
        assign_observation(&store, 5.0, &obs("a", 59.0, 10.0)).unwrap();

        let path = std::env::temp_dir().join(format!("camsite-{}.kml", uuid::Uuid::new_v4()));
        assert_eq!(write_kml(&store, &path).unwrap(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().contains("<Placemark>"));

        let _ = std::fs::remove_file(path);
    }
}

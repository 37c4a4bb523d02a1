#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geometry helpers for GPS point sets.
//!
//! Distances use the Haversine formula on a spherical Earth. Areas use the
//! shoelace formula in degree space scaled by a flat-earth meters-per-degree
//! factor at the mean latitude, which is accurate enough for clusters that
//! span tens of meters. All functions are pure and total: degenerate input
//! produces a defined degenerate result instead of an error.

use std::cmp::Ordering;

use camsite_cluster_models::{BoundingBox, GeoPoint};

/// Mean Earth radius used for Haversine distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Approximate meters per degree used to scale shoelace areas.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance in meters between two coordinates.
#[must_use]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();

    c * EARTH_RADIUS_METERS
}

/// [`haversine_distance`] between two [`GeoPoint`]s.
#[must_use]
pub fn distance(a: GeoPoint, b: GeoPoint) -> f64 {
    haversine_distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Arithmetic mean of the points, or `None` for an empty slice.
#[must_use]
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }

    let (lat_sum, lon_sum) = points.iter().fold((0.0, 0.0), |(lat, lon), p| {
        (lat + p.latitude, lon + p.longitude)
    });

    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;

    Some(GeoPoint::new(lat_sum / n, lon_sum / n))
}

/// Latitude/longitude extent of the points, or `None` for an empty slice.
#[must_use]
pub fn bounding_box(points: &[GeoPoint]) -> Option<BoundingBox> {
    let first = points.first()?;
    let init = BoundingBox::new(
        first.latitude,
        first.latitude,
        first.longitude,
        first.longitude,
    );

    Some(points.iter().skip(1).fold(init, |b, p| {
        BoundingBox::new(
            b.min_latitude.min(p.latitude),
            b.max_latitude.max(p.latitude),
            b.min_longitude.min(p.longitude),
            b.max_longitude.max(p.longitude),
        )
    }))
}

/// Points that touch an edge of `bbox`, in input order.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn extreme_points(points: &[GeoPoint], bbox: &BoundingBox) -> Vec<GeoPoint> {
    points
        .iter()
        .filter(|p| {
            p.latitude == bbox.min_latitude
                || p.latitude == bbox.max_latitude
                || p.longitude == bbox.min_longitude
                || p.longitude == bbox.max_longitude
        })
        .copied()
        .collect()
}

/// Cross product of `o->a` and `o->b` with longitude as x and latitude as y.
/// Positive for a counter-clockwise (left) turn.
fn cross(o: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
    (a.longitude - o.longitude) * (b.latitude - o.latitude)
        - (a.latitude - o.latitude) * (b.longitude - o.longitude)
}

fn lat_lon_order(a: &GeoPoint, b: &GeoPoint) -> Ordering {
    a.latitude
        .total_cmp(&b.latitude)
        .then_with(|| a.longitude.total_cmp(&b.longitude))
}

/// Convex hull of the points via Graham scan.
///
/// The pivot is the point with the smallest `(latitude, longitude)`; the
/// remaining points are swept in polar-angle order and only strict left
/// turns are kept, so collinear and duplicate points are dropped. The
/// returned ring starts at the pivot, runs counter-clockwise (longitude as
/// x, latitude as y) and is left open. The result depends only on the set
/// of input points, not their order.
///
/// Fewer than three points are returned unchanged.
#[must_use]
pub fn convex_hull(points: &[GeoPoint]) -> Vec<GeoPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let Some(pivot) = points.iter().copied().min_by(lat_lon_order) else {
        return Vec::new();
    };

    let mut rest: Vec<(f64, f64, GeoPoint)> = points
        .iter()
        .filter(|p| lat_lon_order(p, &pivot) != Ordering::Equal)
        .map(|&p| {
            let dx = p.longitude - pivot.longitude;
            let dy = p.latitude - pivot.latitude;
            (dy.atan2(dx), dx.hypot(dy), p)
        })
        .collect();

    rest.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| a.1.total_cmp(&b.1))
            .then_with(|| lat_lon_order(&a.2, &b.2))
    });
    rest.dedup_by(|a, b| lat_lon_order(&a.2, &b.2) == Ordering::Equal);

    let mut hull: Vec<GeoPoint> = Vec::with_capacity(rest.len() + 1);
    hull.push(pivot);

    for (_, _, point) in rest {
        while hull.len() > 1 && cross(hull[hull.len() - 2], hull[hull.len() - 1], point) <= 0.0 {
            hull.pop();
        }
        hull.push(point);
    }

    hull
}

/// Approximate area in square meters of a polygon ring.
///
/// Shoelace formula in degree space, scaled by
/// `METERS_PER_DEGREE² × cos(mean latitude)`. Returns 0 for fewer than
/// three vertices.
#[must_use]
pub fn polygon_area(ring: &[GeoPoint]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }

    let n = ring.len();
    let twice_area: f64 = (0..n)
        .map(|i| {
            let p = ring[i];
            let q = ring[(i + 1) % n];
            p.latitude * q.longitude - q.latitude * p.longitude
        })
        .sum();

    let area_deg = twice_area.abs() / 2.0;

    #[allow(clippy::cast_precision_loss)]
    let mean_lat = ring.iter().map(|p| p.latitude).sum::<f64>() / n as f64;

    area_deg * METERS_PER_DEGREE * METERS_PER_DEGREE * mean_lat.to_radians().cos()
}

/// Perimeter in meters of a polygon ring, wrapping from the last vertex
/// back to the first. Returns 0 for fewer than two vertices.
#[must_use]
pub fn polygon_perimeter(ring: &[GeoPoint]) -> f64 {
    if ring.len() < 2 {
        return 0.0;
    }

    let n = ring.len();
    (0..n).map(|i| distance(ring[i], ring[(i + 1) % n])).sum()
}

/// Half-widths in degrees of a latitude/longitude window guaranteed to
/// contain every point within `radius_meters` of `center`.
///
/// Returns `None` when no finite window exists (the radius reaches a pole,
/// covers half the globe, or the window would cross the antimeridian);
/// callers should then fall back to a full scan.
#[must_use]
pub fn degree_envelope(center: GeoPoint, radius_meters: f64) -> Option<(f64, f64)> {
    if !radius_meters.is_finite() || radius_meters < 0.0 {
        return None;
    }

    let angular = radius_meters / EARTH_RADIUS_METERS;
    if angular >= std::f64::consts::FRAC_PI_2 {
        return None;
    }

    let d_lat = angular.to_degrees();
    let far_lat = center.latitude.abs() + d_lat;
    if far_lat >= 90.0 {
        return None;
    }

    let cos_product = center.latitude.to_radians().cos() * far_lat.to_radians().cos();
    let hav = (angular / 2.0).sin().powi(2) / cos_product;
    if !(0.0..1.0).contains(&hav) {
        return None;
    }

    let d_lon = (2.0 * hav.sqrt().asin()).to_degrees();

    // Pad for rounding so boundary points are never pruned.
    let d_lat = d_lat.mul_add(1e-9, d_lat) + 1e-12;
    let d_lon = d_lon.mul_add(1e-9, d_lon) + 1e-12;

    if center.longitude - d_lon < -180.0 || center.longitude + d_lon > 180.0 {
        return None;
    }

    Some((d_lat, d_lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn p(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    /// Rotates a ring so it starts at its smallest vertex.
    fn canonical(ring: &[GeoPoint]) -> Vec<GeoPoint> {
        let start = ring
            .iter()
            .enumerate()
            .min_by(|a, b| lat_lon_order(a.1, b.1))
            .map_or(0, |(i, _)| i);
        ring[start..].iter().chain(&ring[..start]).copied().collect()
    }

    fn signed_area(ring: &[GeoPoint]) -> f64 {
        let n = ring.len();
        (0..n)
            .map(|i| {
                let a = ring[i];
                let b = ring[(i + 1) % n];
                a.longitude * b.latitude - b.longitude * a.latitude
            })
            .sum::<f64>()
            / 2.0
    }

    #[test]
    fn haversine_identity_and_symmetry() {
        assert!(haversine_distance(59.0, 10.0, 59.0, 10.0).abs() < f64::EPSILON);
        let ab = haversine_distance(59.0, 10.0, 59.005, 10.005);
        let ba = haversine_distance(59.005, 10.005, 59.0, 10.0);
        assert!(approx(ab, ba, 1e-9));
    }

    #[test]
    fn haversine_matches_known_distances() {
        // One degree of latitude on a 6371 km sphere.
        assert!(approx(
            haversine_distance(0.0, 0.0, 1.0, 0.0),
            111_194.93,
            0.01
        ));
        // Oslo to Bergen, roughly 305 km.
        let d = haversine_distance(59.9139, 10.7522, 60.3913, 5.3221);
        assert!(approx(d, 305_000.0, 2_000.0), "got {d}");
        // Antipodal points are half the circumference apart.
        let half = haversine_distance(0.0, 0.0, 0.0, 180.0);
        assert!(approx(half, std::f64::consts::PI * EARTH_RADIUS_METERS, 1e-3));
    }

    #[test]
    fn nearby_trail_camera_points() {
        let d = haversine_distance(59.0, 10.0, 59.00002, 10.00001);
        assert!(d > 2.0 && d < 2.5, "got {d}");
        assert!(haversine_distance(59.0, 10.0, 59.005, 10.005) > 500.0);
    }

    #[test]
    fn centroid_is_the_mean() {
        assert_eq!(centroid(&[]), None);
        let c = centroid(&[p(1.0, 2.0), p(3.0, 6.0)]).unwrap();
        assert!(approx(c.latitude, 2.0, 1e-12));
        assert!(approx(c.longitude, 4.0, 1e-12));
    }

    #[test]
    fn bounding_box_and_extremes() {
        let pts = [p(1.0, 1.0), p(2.0, 5.0), p(1.5, 3.0), p(0.5, 2.0)];
        let bbox = bounding_box(&pts).unwrap();
        assert_eq!(bbox, BoundingBox::new(0.5, 2.0, 1.0, 5.0));
        // The interior point (1.5, 3.0) touches no edge.
        assert_eq!(
            extreme_points(&pts, &bbox),
            vec![p(1.0, 1.0), p(2.0, 5.0), p(0.5, 2.0)]
        );
        assert_eq!(bounding_box(&[]), None);
    }

    #[test]
    fn hull_of_fewer_than_three_points_is_unchanged() {
        assert!(convex_hull(&[]).is_empty());
        let two = [p(1.0, 1.0), p(0.0, 0.0)];
        assert_eq!(convex_hull(&two), two.to_vec());
    }

    #[test]
    fn hull_drops_interior_points_and_runs_counter_clockwise() {
        let pts = [
            p(0.0, 0.0),
            p(0.0, 1.0),
            p(1.0, 1.0),
            p(1.0, 0.0),
            p(0.5, 0.5),
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&p(0.5, 0.5)));
        assert_eq!(hull[0], p(0.0, 0.0));
        assert!(signed_area(&hull) > 0.0);
    }

    #[test]
    fn hull_is_independent_of_input_order() {
        let pts = vec![
            p(59.0, 10.0),
            p(59.00003, 10.00001),
            p(59.00001, 10.00004),
            p(59.00002, 10.00002),
            p(59.00004, 10.00003),
            p(58.99999, 10.00002),
        ];
        let expected = canonical(&convex_hull(&pts));

        let mut reversed = pts.clone();
        reversed.reverse();
        assert_eq!(canonical(&convex_hull(&reversed)), expected);

        let mut rotated = pts;
        rotated.rotate_left(2);
        assert_eq!(canonical(&convex_hull(&rotated)), expected);
    }

    #[test]
    fn collinear_points_give_degenerate_hull() {
        let pts = [p(0.0, 0.0), p(0.0002, 0.0002), p(0.0001, 0.0001)];
        let hull = convex_hull(&pts);
        assert_eq!(hull, vec![p(0.0, 0.0), p(0.0002, 0.0002)]);
        assert!(polygon_area(&hull).abs() < f64::EPSILON);
    }

    #[test]
    fn triangle_hull_is_the_triangle() {
        let pts = [p(0.0, 0.0), p(0.0, 0.001), p(0.001, 0.0)];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 3);
        for point in &pts {
            assert!(hull.contains(point));
        }
    }

    #[test]
    fn duplicate_points_collapse() {
        let pts = [p(0.0, 0.0), p(0.0, 0.0), p(1.0, 0.0), p(0.0, 1.0), p(1.0, 0.0)];
        assert_eq!(convex_hull(&pts).len(), 3);
    }

    #[test]
    fn area_of_small_square_at_equator() {
        let side = 0.0001;
        let square = [p(0.0, 0.0), p(0.0, side), p(side, side), p(side, 0.0)];
        let expected = side * side * METERS_PER_DEGREE * METERS_PER_DEGREE;
        assert!(approx(polygon_area(&square), expected, 1e-6));
        assert!(polygon_area(&square[..2]).abs() < f64::EPSILON);
    }

    #[test]
    fn area_shrinks_with_latitude() {
        let side = 0.0001;
        let at = |lat: f64| {
            polygon_area(&[
                p(lat, 0.0),
                p(lat, side),
                p(lat + side, side),
                p(lat + side, 0.0),
            ])
        };
        assert!(at(60.0) < at(0.0));
        assert!(approx(at(60.0) / at(0.0), 0.5, 1e-3));
    }

    #[test]
    fn perimeter_wraps_around() {
        let side = 0.0001;
        let square = [p(0.0, 0.0), p(0.0, side), p(side, side), p(side, 0.0)];
        let edge = haversine_distance(0.0, 0.0, 0.0, side);
        assert!(approx(polygon_perimeter(&square), 4.0 * edge, 1e-6));
        assert!(polygon_perimeter(&square[..1]).abs() < f64::EPSILON);
        assert!(approx(polygon_perimeter(&square[..2]), 2.0 * edge, 1e-9));
    }

    #[test]
    fn degree_envelope_contains_points_at_radius() {
        let center = p(59.0, 10.0);
        let (d_lat, d_lon) = degree_envelope(center, 5.0).unwrap();

        // Due north and due east at exactly the radius must be inside.
        let north = 5.0 / EARTH_RADIUS_METERS;
        assert!(north.to_degrees() <= d_lat);
        let east_lon = 10.0 + d_lon;
        assert!(haversine_distance(59.0, 10.0, 59.0, east_lon) >= 5.0 - 1e-9);
    }

    #[test]
    fn degree_envelope_gives_up_near_poles_and_antimeridian() {
        assert!(degree_envelope(p(89.99999, 0.0), 5.0).is_none());
        assert!(degree_envelope(p(0.0, 179.99999), 5.0).is_none());
        assert!(degree_envelope(p(0.0, 0.0), f64::NAN).is_none());
        assert!(degree_envelope(p(0.0, 0.0), 2.0e7).is_none());
    }
}

//! Transverse Mercator projection on the WGS84 ellipsoid.
//!
//! Forward and inverse series from Snyder, "Map Projections: A Working
//! Manual" (USGS PP 1395), pp. 61-64. Accurate to well under a metre within
//! a few degrees of the central meridian, which covers a zone and its
//! neighbours.

use super::types::UtmZone;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

fn e2() -> f64 {
    WGS84_F * (2.0 - WGS84_F)
}

fn ep2() -> f64 {
    let e2 = e2();
    e2 / (1.0 - e2)
}

/// Meridian arc length from the equator to latitude `phi` (radians).
fn meridian_arc(phi: f64) -> f64 {
    let e2 = e2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

/// Projects geographic coordinates into the given UTM zone.
///
/// Longitudes outside the zone are projected against the zone's central
/// meridian, which is how neighbouring-zone geometry is carried into a
/// tile's CRS.
///
/// # Returns
///
/// `(easting, northing)` in metres. Southern-hemisphere zones include the
/// 10,000 km false northing.
pub fn forward(zone: UtmZone, lat: f64, lon: f64) -> (f64, f64) {
    let e2 = e2();
    let ep2 = ep2();

    let phi = lat.to_radians();
    let lambda0 = zone.central_meridian().to_radians();
    let mut dlon = lon.to_radians() - lambda0;
    // Keep the longitude difference in (-pi, pi] across the antimeridian.
    if dlon > std::f64::consts::PI {
        dlon -= 2.0 * std::f64::consts::PI;
    } else if dlon < -std::f64::consts::PI {
        dlon += 2.0 * std::f64::consts::PI;
    }

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = dlon * cos_phi;
    let m = meridian_arc(phi);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let easting = K0
        * n
        * (a + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + FALSE_EASTING;

    let mut northing = K0
        * (m + n
            * tan_phi
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));

    if !zone.north {
        northing += FALSE_NORTHING_SOUTH;
    }

    (easting, northing)
}

/// Converts UTM coordinates in the given zone back to geographic coordinates.
///
/// # Returns
///
/// `(lat, lon)` in degrees, longitude normalised to [-180, 180).
pub fn inverse(zone: UtmZone, easting: f64, northing: f64) -> (f64, f64) {
    let e2 = e2();
    let ep2 = ep2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let x = easting - FALSE_EASTING;
    let y = if zone.north {
        northing
    } else {
        northing - FALSE_NORTHING_SOUTH
    };

    let m = y / K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
    let sqrt_1e2 = (1.0 - e2).sqrt();
    let e1 = (1.0 - sqrt_1e2) / (1.0 + sqrt_1e2);

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let n1 = WGS84_A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d2 / 2.0 - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let dlon = (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d5 / 120.0)
        / cos_phi1;

    let mut lon = zone.central_meridian() + dlon.to_degrees();
    if lon >= 180.0 {
        lon -= 360.0;
    } else if lon < -180.0 {
        lon += 360.0;
    }

    (phi.to_degrees(), lon)
}

/// Converts a coordinate from one UTM zone to another via geographic
/// coordinates. Identity when the zones are equal.
pub fn transform(from: UtmZone, to: UtmZone, easting: f64, northing: f64) -> (f64, f64) {
    if from == to {
        return (easting, northing);
    }
    let (lat, lon) = inverse(from, easting, northing);
    forward(to, lat, lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(z: u8, north: bool) -> UtmZone {
        UtmZone::new(z, north).unwrap()
    }

    #[test]
    fn test_equator_on_central_meridian() {
        let (e, n) = forward(zone(31, true), 0.0, 3.0);
        assert!((e - 500_000.0).abs() < 1e-6);
        assert!(n.abs() < 1e-6);
    }

    #[test]
    fn test_south_false_northing() {
        let (_, n) = forward(zone(31, false), 0.0, 3.0);
        assert!((n - 10_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_known_point_san_francisco_bay() {
        // 37.5N 123W lies on the zone 10 central meridian.
        let (e, n) = forward(zone(10, true), 37.5, -123.0);
        assert!((e - 500_000.0).abs() < 1e-6);
        // Meridian arc at 37.5 degrees scaled by k0.
        assert!((4_140_000.0..4_160_000.0).contains(&n), "northing {}", n);
    }

    #[test]
    fn test_round_trip_within_zone() {
        let z = zone(33, true);
        for &(lat, lon) in &[(10.0, 15.0), (45.5, 13.2), (62.0, 17.9), (0.5, 12.1)] {
            let (e, n) = forward(z, lat, lon);
            let (lat2, lon2) = inverse(z, e, n);
            assert!((lat - lat2).abs() < 1e-6, "lat {} vs {}", lat, lat2);
            assert!((lon - lon2).abs() < 1e-6, "lon {} vs {}", lon, lon2);
        }
    }

    #[test]
    fn test_round_trip_southern_hemisphere() {
        let z = zone(55, false);
        let (e, n) = forward(z, -33.86, 151.2);
        let (lat, lon) = inverse(z, e, n);
        assert!((lat + 33.86).abs() < 1e-6);
        assert!((lon - 151.2).abs() < 1e-6);
    }

    #[test]
    fn test_transform_between_zones_preserves_location() {
        let a = zone(10, true);
        let b = zone(11, true);
        let (e, n) = forward(a, 40.0, -120.2);
        let (e2, n2) = transform(a, b, e, n);
        let (lat, lon) = inverse(b, e2, n2);
        assert!((lat - 40.0).abs() < 1e-5);
        assert!((lon + 120.2).abs() < 1e-5);
    }

    #[test]
    fn test_transform_identity() {
        let z = zone(18, true);
        assert_eq!(transform(z, z, 123.0, 456.0), (123.0, 456.0));
    }
}

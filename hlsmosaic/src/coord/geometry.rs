//! Geographic query geometries (WGS84 longitude/latitude).

use std::fmt;
use std::str::FromStr;

use super::types::GridResolutionError;

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Checks that the coordinate is finite and within WGS84 limits.
    pub fn validate(&self) -> Result<(), GridResolutionError> {
        let valid = self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat);
        if valid {
            Ok(())
        } else {
            Err(GridResolutionError::InvalidCoordinate {
                lon: self.lon,
                lat: self.lat,
            })
        }
    }
}

/// A simple polygon given by its outer ring.
///
/// The ring may be open or closed; a closing vertex equal to the first is
/// ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<Point>,
}

impl Polygon {
    pub fn new(mut ring: Vec<Point>) -> Self {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        Self { ring }
    }

    /// Vertices of the outer ring, without a closing duplicate.
    pub fn vertices(&self) -> &[Point] {
        &self.ring
    }

    /// Geographic bounding box of the vertices.
    pub fn bbox(&self) -> BoundingBox {
        let mut bbox = BoundingBox {
            west: f64::INFINITY,
            south: f64::INFINITY,
            east: f64::NEG_INFINITY,
            north: f64::NEG_INFINITY,
        };
        for p in &self.ring {
            bbox.west = bbox.west.min(p.lon);
            bbox.east = bbox.east.max(p.lon);
            bbox.south = bbox.south.min(p.lat);
            bbox.north = bbox.north.max(p.lat);
        }
        bbox
    }
}

/// Axis-aligned geographic rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Corners as a polygon, counter-clockwise from south-west.
    pub fn to_polygon(&self) -> Polygon {
        Polygon::new(vec![
            Point::new(self.west, self.south),
            Point::new(self.east, self.south),
            Point::new(self.east, self.north),
            Point::new(self.west, self.north),
        ])
    }

    /// `west,south,east,north` as used by STAC `bbox` parameters.
    pub fn to_query_string(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}",
            self.west, self.south, self.east, self.north
        )
    }
}

impl FromStr for BoundingBox {
    type Err = GridResolutionError;

    /// Parses `west,south,east,north`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<f64> = s
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| GridResolutionError::EmptyGeometry)?;
        match values.as_slice() {
            [w, s, e, n] => Ok(Self::new(*w, *s, *e, *n)),
            _ => Err(GridResolutionError::EmptyGeometry),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.west, self.south, self.east, self.north
        )
    }
}

/// A query geometry.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point),
    Polygon(Polygon),
    BoundingBox(BoundingBox),
}

impl Geometry {
    /// Checks coordinates and shape.
    pub fn validate(&self) -> Result<(), GridResolutionError> {
        match self {
            Geometry::Point(p) => p.validate(),
            Geometry::Polygon(poly) => {
                if poly.vertices().len() < 3 {
                    return Err(GridResolutionError::EmptyGeometry);
                }
                poly.vertices().iter().try_for_each(Point::validate)
            }
            Geometry::BoundingBox(b) => {
                Point::new(b.west, b.south).validate()?;
                Point::new(b.east, b.north).validate()?;
                if b.west > b.east || b.south > b.north {
                    return Err(GridResolutionError::EmptyGeometry);
                }
                Ok(())
            }
        }
    }

    /// Geographic bounding box of the geometry.
    pub fn bbox(&self) -> BoundingBox {
        match self {
            Geometry::Point(p) => BoundingBox::new(p.lon, p.lat, p.lon, p.lat),
            Geometry::Polygon(poly) => poly.bbox(),
            Geometry::BoundingBox(b) => *b,
        }
    }

    /// Vertices of the geometry (a single vertex for points).
    pub fn vertices(&self) -> Vec<Point> {
        match self {
            Geometry::Point(p) => vec![*p],
            Geometry::Polygon(poly) => poly.vertices().to_vec(),
            Geometry::BoundingBox(b) => b.to_polygon().vertices().to_vec(),
        }
    }

    /// True for areal geometries.
    pub fn is_areal(&self) -> bool {
        !matches!(self, Geometry::Point(_))
    }
}

impl From<Point> for Geometry {
    fn from(p: Point) -> Self {
        Geometry::Point(p)
    }
}

impl From<Polygon> for Geometry {
    fn from(p: Polygon) -> Self {
        Geometry::Polygon(p)
    }
}

impl From<BoundingBox> for Geometry {
    fn from(b: BoundingBox) -> Self {
        Geometry::BoundingBox(b)
    }
}

// ============================================================================
// Planar predicates in projected space
// ============================================================================

/// Ray-casting point-in-polygon test on planar coordinates.
pub(crate) fn point_in_ring(x: f64, y: f64, ring: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = ring.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

/// Closed segment intersection test.
pub(crate) fn segments_intersect(
    p1: (f64, f64),
    p2: (f64, f64),
    q1: (f64, f64),
    q2: (f64, f64),
) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

/// Tests whether a planar polygon intersects an axis-aligned rectangle
/// `(min_x, min_y, max_x, max_y)`.
pub(crate) fn ring_intersects_rect(ring: &[(f64, f64)], rect: (f64, f64, f64, f64)) -> bool {
    let (min_x, min_y, max_x, max_y) = rect;
    let inside = |&(x, y): &(f64, f64)| x >= min_x && x <= max_x && y >= min_y && y <= max_y;

    if ring.iter().any(inside) {
        return true;
    }

    let corners = [
        (min_x, min_y),
        (max_x, min_y),
        (max_x, max_y),
        (min_x, max_y),
    ];
    if ring.len() >= 3 && corners.iter().any(|&(x, y)| point_in_ring(x, y, ring)) {
        return true;
    }

    let n = ring.len();
    for i in 0..n {
        let a = ring[i];
        let b = ring[(i + 1) % n];
        for k in 0..4 {
            if segments_intersect(a, b, corners[k], corners[(k + 1) % 4]) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_validation() {
        assert!(Point::new(10.0, 45.0).validate().is_ok());
        assert!(Point::new(181.0, 0.0).validate().is_err());
        assert!(Point::new(0.0, f64::NAN).validate().is_err());
    }

    #[test]
    fn test_polygon_drops_closing_vertex() {
        let poly = Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 0.0),
        ]);
        assert_eq!(poly.vertices().len(), 3);
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let geom = Geometry::Polygon(Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]));
        assert_eq!(geom.validate(), Err(GridResolutionError::EmptyGeometry));
    }

    #[test]
    fn test_bbox_parse() {
        let b: BoundingBox = "-123.0, 37.0, -122.0, 38.0".parse().unwrap();
        assert_eq!(b, BoundingBox::new(-123.0, 37.0, -122.0, 38.0));
        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_inverted_bbox_rejected() {
        let geom = Geometry::BoundingBox(BoundingBox::new(1.0, 0.0, 0.0, 1.0));
        assert!(geom.validate().is_err());
    }

    #[test]
    fn test_point_in_ring() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_ring(5.0, 5.0, &square));
        assert!(!point_in_ring(15.0, 5.0, &square));
    }

    #[test]
    fn test_ring_intersects_rect_cases() {
        let rect = (0.0, 0.0, 10.0, 10.0);
        // Vertex inside.
        assert!(ring_intersects_rect(&[(5.0, 5.0), (20.0, 5.0), (20.0, 20.0)], rect));
        // Rectangle inside polygon.
        assert!(ring_intersects_rect(
            &[(-5.0, -5.0), (15.0, -5.0), (15.0, 15.0), (-5.0, 15.0)],
            rect
        ));
        // Edges crossing without contained vertices.
        assert!(ring_intersects_rect(
            &[(-5.0, 4.0), (15.0, 4.0), (15.0, 6.0), (-5.0, 6.0)],
            rect
        ));
        // Disjoint.
        assert!(!ring_intersects_rect(&[(20.0, 20.0), (30.0, 20.0), (30.0, 30.0)], rect));
    }
}

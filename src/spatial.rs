use serde::{Deserialize, Serialize};
use tracing::debug;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;
pub const NOT_IDENTIFIED: &str = "NOT_IDENTIFIED";
pub const NO_LOCATION_REGISTERED: &str = "NO_LOCATION_REGISTERED";
pub const DEFAULT_MATCH_RADIUS_METERS: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLocation {
    pub label: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl ReferenceLocation {
    pub fn new(
        label: impl Into<String>,
        display_name: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            label: label.into(),
            display_name: display_name.into(),
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub label: String,
    pub display_name: String,
    /// Great-circle distance to the nearest reference, `f64::INFINITY` when none exist.
    pub distance_meters: f64,
}

impl MatchOutcome {
    pub fn unidentified(distance_meters: f64) -> Self {
        Self {
            label: NOT_IDENTIFIED.to_string(),
            display_name: NO_LOCATION_REGISTERED.to_string(),
            distance_meters,
        }
    }

    pub fn is_identified(&self) -> bool {
        self.label != NOT_IDENTIFIED
    }
}

/// Haversine distance in meters between two `(lat, lng)` points in degrees.
pub fn haversine_meters(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lng1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lng2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().min(1.0).asin()
}

/// Nearest-reference lookup. Candidates are pruned in raw degree space and
/// the winner is then checked against the radius by haversine distance.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    locations: Vec<ReferenceLocation>,
    tree: Option<KdTree>,
}

impl SpatialIndex {
    pub fn build(locations: Vec<ReferenceLocation>) -> Self {
        if locations.is_empty() {
            debug!(target: "spatial_index", "no reference locations; index absent");
            return Self::default();
        }
        let points = locations
            .iter()
            .map(|loc| [loc.latitude, loc.longitude])
            .collect();
        debug!(
            target: "spatial_index",
            locations = locations.len(),
            "spatial index built"
        );
        Self {
            tree: Some(KdTree::build(points)),
            locations,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.tree.is_none()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn locations(&self) -> &[ReferenceLocation] {
        &self.locations
    }

    pub fn nearest(&self, latitude: f64, longitude: f64, radius_meters: f64) -> MatchOutcome {
        let Some(tree) = &self.tree else {
            return MatchOutcome::unidentified(f64::INFINITY);
        };
        let Some(index) = tree.nearest([latitude, longitude]) else {
            return MatchOutcome::unidentified(f64::INFINITY);
        };

        let candidate = &self.locations[index];
        let distance = haversine_meters(
            (latitude, longitude),
            (candidate.latitude, candidate.longitude),
        );
        if distance <= radius_meters {
            MatchOutcome {
                label: candidate.label.clone(),
                display_name: candidate.display_name.clone(),
                distance_meters: distance,
            }
        } else {
            MatchOutcome::unidentified(distance)
        }
    }
}

/// Balanced 2-d tree stored implicitly: each subrange of `order` is split at
/// its midpoint on the axis given by depth parity.
#[derive(Debug)]
struct KdTree {
    points: Vec<[f64; 2]>,
    order: Vec<usize>,
}

impl KdTree {
    fn build(points: Vec<[f64; 2]>) -> Self {
        let mut order: Vec<usize> = (0..points.len()).collect();
        split(&points, &mut order, 0);
        Self { points, order }
    }

    fn nearest(&self, query: [f64; 2]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        self.search(query, 0, self.order.len(), 0, &mut best);
        best.map(|(index, _)| index)
    }

    fn search(
        &self,
        query: [f64; 2],
        lo: usize,
        hi: usize,
        depth: usize,
        best: &mut Option<(usize, f64)>,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let index = self.order[mid];
        let point = self.points[index];
        let dist = squared_planar(query, point);
        if best.map_or(true, |(_, current)| dist < current) {
            *best = Some((index, dist));
        }

        let axis = depth % 2;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };
        self.search(query, near.0, near.1, depth + 1, best);
        if best.map_or(true, |(_, current)| diff * diff < current) {
            self.search(query, far.0, far.1, depth + 1, best);
        }
    }
}

fn split(points: &[[f64; 2]], order: &mut [usize], depth: usize) {
    if order.len() <= 1 {
        return;
    }
    let axis = depth % 2;
    order.sort_by(|a, b| points[*a][axis].total_cmp(&points[*b][axis]));
    let mid = order.len() / 2;
    let (left, right) = order.split_at_mut(mid);
    split(points, left, depth + 1);
    split(points, &mut right[1..], depth + 1);
}

fn squared_planar(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dlat = a[0] - b[0];
    let dlng = a[1] - b[1];
    dlat * dlat + dlng * dlng
}

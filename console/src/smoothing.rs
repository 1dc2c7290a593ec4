// Render-ready flight path from the telemetry history.

use crate::store::StoreSnapshot;
use droneguard_shared::TelemetrySource;
use serde::Serialize;

pub const DEFAULT_SMOOTHING_STEPS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    fn lerp(self, to: GeoPoint, t: f64) -> GeoPoint {
        GeoPoint {
            lat: self.lat + (to.lat - self.lat) * t,
            lon: self.lon + (to.lon - self.lon) * t,
        }
    }
}

impl From<(f64, f64)> for GeoPoint {
    fn from((lat, lon): (f64, f64)) -> Self {
        GeoPoint { lat, lon }
    }
}

/// Linear interpolation between consecutive fixes.
///
/// Every pair contributes its start point plus `steps - 1` intermediate
/// points, and the last input point is always emitted, so `n` inputs give
/// `steps * (n - 1) + 1` outputs. `steps` of 0 or 1 returns the input as is.
pub fn smooth(points: &[GeoPoint], steps: usize) -> Vec<GeoPoint> {
    let steps = steps.max(1);
    let Some(last) = points.last() else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(steps * (points.len() - 1) + 1);
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        out.push(a);
        for s in 1..steps {
            out.push(a.lerp(b, s as f64 / steps as f64));
        }
    }
    out.push(*last);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathSegment {
    pub source: TelemetrySource,
    pub points: Vec<GeoPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlightPath {
    /// Whole track, smoothed.
    pub path: Vec<GeoPoint>,
    /// One smoothed run per stretch of same-source fixes, in time order.
    pub segments: Vec<PathSegment>,
    /// Raw fix count before smoothing.
    pub fixes: usize,
}

impl FlightPath {
    pub fn last_fix(&self) -> Option<GeoPoint> {
        self.path.last().copied()
    }

    pub fn segments_from(&self, source: TelemetrySource) -> impl Iterator<Item = &PathSegment> {
        self.segments.iter().filter(move |s| s.source == source)
    }
}

/// Fixes with both coordinates, oldest first.
pub fn gps_fixes(snapshot: &StoreSnapshot) -> Vec<(GeoPoint, TelemetrySource)> {
    snapshot
        .telemetry_chronological()
        .filter_map(|s| s.gps().map(|p| (GeoPoint::from(p), s.source)))
        .collect()
}

/// Each new segment starts on the previous segment's last fix so the drawn
/// line stays connected across a source change.
pub fn flight_path(snapshot: &StoreSnapshot, steps: usize) -> FlightPath {
    let fixes = gps_fixes(snapshot);
    let points: Vec<GeoPoint> = fixes.iter().map(|(p, _)| *p).collect();

    let mut raw_segments: Vec<(TelemetrySource, Vec<GeoPoint>)> = Vec::new();
    for (point, source) in &fixes {
        match raw_segments.last_mut() {
            Some((current, pts)) if current == source => pts.push(*point),
            Some((_, pts)) => {
                let joint = pts.last().copied();
                raw_segments.push((*source, joint.into_iter().chain([*point]).collect()));
            }
            None => raw_segments.push((*source, vec![*point])),
        }
    }

    FlightPath {
        path: smooth(&points, steps),
        segments: raw_segments
            .into_iter()
            .map(|(source, pts)| PathSegment {
                source,
                points: smooth(&pts, steps),
            })
            .collect(),
        fixes: fixes.len(),
    }
}

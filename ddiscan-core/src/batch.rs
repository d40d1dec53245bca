//! Points, batches and the batcher that cuts the point stream into batches.

use serde::ser::{SerializeSeq, SerializeTuple, Serializer};
use serde::Serialize;
use std::sync::Arc;

use crate::protocol::Record;
use crate::range::tof_to_distance_mm;

/// Number of points that triggers a batch (150 records)
pub const BATCH_SIZE: usize = 300;

/// A `(distance_mm, value)` pair as drawn by the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub distance_mm: f32,
    pub value: f32,
}

impl Point {
    pub fn new(distance_mm: f32, value: f32) -> Self {
        Point { distance_mm, value }
    }

    /// The two points one record contributes: a baseline at zero and the
    /// echo amplitude, both at the record's distance. Drawn as a connected
    /// line this gives one vertical spike per echo.
    pub fn pair_from_record(record: &Record) -> (Point, Point) {
        let distance = tof_to_distance_mm(record.tof_us);
        (Point::new(distance, 0.0), Point::new(distance, record.amplitude))
    }
}

// Serialized as a compact `[distance, value]` pair
impl Serialize for Point {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.distance_mm)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

/// An immutable, ordered snapshot of points.
///
/// Cloning shares the same allocation; there is no way to mutate a batch
/// once it has been built.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    points: Arc<[Point]>,
}

impl Batch {
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }
}

impl From<Vec<Point>> for Batch {
    fn from(points: Vec<Point>) -> Self {
        Batch {
            points: points.into(),
        }
    }
}

impl Serialize for Batch {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.points.len()))?;
        for point in self.points.iter() {
            seq.serialize_element(point)?;
        }
        seq.end()
    }
}

/// Accumulates points and releases them as [`Batch`]es of [`BATCH_SIZE`].
#[derive(Debug)]
pub struct Batcher {
    points: Vec<Point>,
}

impl Default for Batcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Batcher {
    pub fn new() -> Self {
        Batcher {
            points: Vec::with_capacity(BATCH_SIZE),
        }
    }

    /// Append the two points of one record.
    pub fn push(&mut self, baseline: Point, signal: Point) {
        self.points.push(baseline);
        self.points.push(signal);
    }

    /// If the threshold is reached, hand out everything accumulated so far
    /// as one batch and start over empty.
    ///
    /// Call once per record, after [`Batcher::push`].
    pub fn drain_if_ready(&mut self) -> Option<Batch> {
        if self.points.len() < BATCH_SIZE {
            return None;
        }
        let points = std::mem::replace(&mut self.points, Vec::with_capacity(BATCH_SIZE));
        Some(Batch::from(points))
    }

    /// Points accumulated since the last batch
    pub fn pending_len(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(amplitude: f32, tof_us: f32) -> Record {
        Record { amplitude, tof_us }
    }

    #[test]
    fn test_record_yields_baseline_and_signal() {
        let (baseline, signal) = Point::pair_from_record(&record(12.5, 2000.0));
        assert_eq!(baseline, Point::new(343.0, 0.0));
        assert_eq!(signal, Point::new(343.0, 12.5));
    }

    #[test]
    fn test_150_records_make_exactly_one_batch() {
        let mut batcher = Batcher::new();
        let mut batches = Vec::new();
        for i in 0..150 {
            let (a, b) = Point::pair_from_record(&record(i as f32, 1000.0));
            batcher.push(a, b);
            batches.extend(batcher.drain_if_ready());
        }
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), BATCH_SIZE);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[test]
    fn test_no_batch_below_threshold() {
        let mut batcher = Batcher::new();
        for _ in 0..149 {
            batcher.push(Point::new(1.0, 0.0), Point::new(1.0, 1.0));
            assert!(batcher.drain_if_ready().is_none());
        }
        assert_eq!(batcher.pending_len(), 298);
    }

    #[test]
    fn test_batch_preserves_order() {
        let mut batcher = Batcher::new();
        let mut batch = None;
        for i in 0..150 {
            let d = i as f32;
            batcher.push(Point::new(d, 0.0), Point::new(d, 1.0));
            batch = batch.or(batcher.drain_if_ready());
        }
        let batch = batch.unwrap();
        assert_eq!(batch.points()[0], Point::new(0.0, 0.0));
        assert_eq!(batch.points()[1], Point::new(0.0, 1.0));
        assert_eq!(batch.points()[299], Point::new(149.0, 1.0));
    }

    #[test]
    fn test_batch_is_a_snapshot() {
        let mut batcher = Batcher::new();
        for _ in 0..150 {
            batcher.push(Point::new(1.0, 0.0), Point::new(1.0, 2.0));
        }
        let batch = batcher.drain_if_ready().unwrap();
        let copy = batch.clone();

        // Further pushes go to a fresh accumulator
        batcher.push(Point::new(9.0, 0.0), Point::new(9.0, 9.0));
        assert_eq!(batch, copy);
        assert!(batch.iter().all(|p| p.distance_mm == 1.0));
    }

    #[test]
    fn test_batch_serializes_as_pairs() {
        let batch = Batch::from(vec![Point::new(171.5, 0.0), Point::new(171.5, 12.5)]);
        let json = serde_json::to_string(&batch).unwrap();
        assert_eq!(json, "[[171.5,0.0],[171.5,12.5]]");
    }
}

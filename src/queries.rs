//! Per-view GPU timestamp bookkeeping.
//!
//! Timestamp readback is asynchronous: the values harvested in frame F
//! belong to the resolve recorded `reuse_horizon` frames earlier. Each view
//! therefore keeps one slot of timestamp labels per frame in flight and
//! cycles through them, publishing elapsed times only once the matching
//! readback data is known to be available.

/// What a recorded timestamp marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimestampLabel {
    /// Before the first pass of the resolve.
    Init,
    /// After the tile classification pass.
    TileClassification,
    /// After the ray intersection pass.
    Intersection,
    /// After the last denoising pass.
    Denoising,
}

/// Upper bound of timestamps recorded per resolve.
pub(crate) const TIMESTAMPS_PER_FRAME: u32 = 4;

/// Ring of timestamp label slots, one per frame in flight.
#[derive(Debug)]
pub(crate) struct TimestampQueryRing {
    slots: Vec<Vec<TimestampLabel>>,
    cursor: usize,
    tile_classification_time: u64,
    intersection_time: u64,
    denoising_time: u64,
}

impl TimestampQueryRing {
    pub fn new(frames_in_flight: u32) -> Self {
        let mut slots = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            slots.push(Vec::with_capacity(TIMESTAMPS_PER_FRAME as usize));
        }
        Self {
            slots,
            cursor: 0,
            tile_classification_time: 0,
            intersection_time: 0,
            denoising_time: 0,
        }
    }

    /// First query index of the slot currently being recorded.
    pub fn base_query(&self) -> u32 {
        self.cursor as u32 * TIMESTAMPS_PER_FRAME
    }

    /// Query index for the next timestamp of the current slot.
    pub fn next_query(&self) -> u32 {
        self.base_query() + self.slots[self.cursor].len() as u32
    }

    /// Number of timestamps recorded into the current slot so far.
    pub fn recorded(&self) -> u32 {
        self.slots[self.cursor].len() as u32
    }

    /// Labels previously recorded into the slot about to be reused.
    pub fn pending_labels(&self) -> &[TimestampLabel] {
        &self.slots[self.cursor]
    }

    /// Folds readback values for the slot about to be reused into the
    /// published elapsed times.
    ///
    /// `values` must contain one tick value per pending label. Differences
    /// between consecutive timestamps are attributed to the label of the
    /// later one.
    pub fn ingest(&mut self, values: &[u64]) {
        let labels = &self.slots[self.cursor];
        debug_assert_eq!(values.len(), labels.len());

        self.tile_classification_time = 0;
        self.intersection_time = 0;
        self.denoising_time = 0;

        for (i, window) in values.windows(2).enumerate() {
            let elapsed = window[1].wrapping_sub(window[0]);
            match labels[i + 1] {
                TimestampLabel::TileClassification => self.tile_classification_time = elapsed,
                TimestampLabel::Intersection => self.intersection_time = elapsed,
                TimestampLabel::Denoising => self.denoising_time = elapsed,
                TimestampLabel::Init => {}
            }
        }
    }

    /// Clears the current slot before re-recording it.
    pub fn begin_frame(&mut self) {
        self.slots[self.cursor].clear();
    }

    /// Appends a label for the timestamp that was just recorded.
    pub fn record(&mut self, label: TimestampLabel) {
        debug_assert!(self.slots[self.cursor].len() < TIMESTAMPS_PER_FRAME as usize);
        self.slots[self.cursor].push(label);
    }

    /// Moves on to the next slot in the ring.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    pub fn tile_classification_time(&self) -> u64 {
        self.tile_classification_time
    }

    pub fn intersection_time(&self) -> u64 {
        self.intersection_time
    }

    pub fn denoising_time(&self) -> u64 {
        self.denoising_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_publishes_nothing() {
        let ring = TimestampQueryRing::new(3);
        assert!(ring.pending_labels().is_empty());
        assert_eq!(ring.tile_classification_time(), 0);
        assert_eq!(ring.intersection_time(), 0);
        assert_eq!(ring.denoising_time(), 0);
    }

    #[test]
    fn test_query_indices_follow_cursor() {
        let mut ring = TimestampQueryRing::new(2);
        assert_eq!(ring.base_query(), 0);
        ring.begin_frame();
        ring.record(TimestampLabel::Init);
        assert_eq!(ring.next_query(), 1);
        ring.advance();
        assert_eq!(ring.base_query(), TIMESTAMPS_PER_FRAME);
        ring.advance();
        assert_eq!(ring.base_query(), 0);
    }

    #[test]
    fn test_ingest_attributes_differences() {
        let mut ring = TimestampQueryRing::new(1);
        ring.begin_frame();
        ring.record(TimestampLabel::Init);
        ring.record(TimestampLabel::TileClassification);
        ring.record(TimestampLabel::Intersection);
        ring.record(TimestampLabel::Denoising);
        ring.advance();

        ring.ingest(&[1000, 1100, 1400, 2000]);
        assert_eq!(ring.tile_classification_time(), 100);
        assert_eq!(ring.intersection_time(), 300);
        assert_eq!(ring.denoising_time(), 600);
    }

    #[test]
    fn test_ingest_without_denoising_label() {
        let mut ring = TimestampQueryRing::new(1);
        ring.begin_frame();
        ring.record(TimestampLabel::Init);
        ring.record(TimestampLabel::TileClassification);
        ring.record(TimestampLabel::Intersection);
        ring.advance();

        ring.ingest(&[0, 50, 250]);
        assert_eq!(ring.tile_classification_time(), 50);
        assert_eq!(ring.intersection_time(), 200);
        assert_eq!(ring.denoising_time(), 0);
    }
}

//! Recording backend for testing and development.
//!
//! Performs no GPU work; every call is appended to an event log that tests
//! inspect to verify pass ordering, hazard placement and double-buffer slot
//! selection. Timestamp readback is simulated with monotonically increasing
//! tick values so the query plumbing can be exercised end to end.

use crate::error::{Error, Result};

use super::{CommandStream, DispatchKind, Hazard, PassKind, ResolveBackend, ViewSetup};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DummyEvent {
    CreateView {
        slot: u32,
        width: u32,
        height: u32,
    },
    DestroyView {
        slot: u32,
    },
    WriteScratch {
        offset: u64,
        len: u64,
    },
    Pass {
        slot: u32,
        pass: PassKind,
        buffer_half: u32,
        constants_offset: u64,
        dispatch: DispatchKind,
    },
    Hazard {
        slot: u32,
        hazard: Hazard,
    },
    Timestamp {
        slot: u32,
        query_index: u32,
    },
    ResolveTimestamps {
        slot: u32,
        first_query: u32,
        query_count: u32,
    },
}

/// No-op backend that records the calls it receives.
#[derive(Debug, Default)]
pub struct DummyBackend {
    scratch_size: u64,
    events: Vec<DummyEvent>,
    ticks: u64,
}

impl DummyBackend {
    pub fn new(scratch_size: u64) -> Self {
        Self {
            scratch_size,
            events: Vec::new(),
            ticks: 0,
        }
    }

    /// The calls recorded so far, in order.
    pub fn events(&self) -> &[DummyEvent] {
        &self.events
    }

    /// The passes recorded so far, in order.
    pub fn passes(&self) -> Vec<PassKind> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DummyEvent::Pass { pass, .. } => Some(*pass),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }
}

impl ResolveBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_view(&mut self, setup: &ViewSetup<'_>) -> Result<()> {
        log::trace!(
            "DummyBackend: creating view slot {} ({}x{})",
            setup.slot,
            setup.width,
            setup.height
        );
        self.events.push(DummyEvent::CreateView {
            slot: setup.slot,
            width: setup.width,
            height: setup.height,
        });
        Ok(())
    }

    fn destroy_view(&mut self, slot: u32) {
        log::trace!("DummyBackend: destroying view slot {slot}");
        self.events.push(DummyEvent::DestroyView { slot });
    }

    fn write_scratch(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.scratch_size {
            return Err(Error::Internal(format!(
                "scratch write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.scratch_size
            )));
        }
        self.events.push(DummyEvent::WriteScratch {
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn encode_pass(
        &mut self,
        _stream: &mut CommandStream<'_>,
        slot: u32,
        pass: PassKind,
        buffer_half: u32,
        constants_offset: u64,
        dispatch: DispatchKind,
    ) -> Result<()> {
        self.events.push(DummyEvent::Pass {
            slot,
            pass,
            buffer_half,
            constants_offset,
            dispatch,
        });
        Ok(())
    }

    fn encode_hazard(&mut self, _stream: &mut CommandStream<'_>, slot: u32, hazard: Hazard) {
        self.events.push(DummyEvent::Hazard { slot, hazard });
    }

    fn write_timestamp(&mut self, _stream: &mut CommandStream<'_>, slot: u32, query_index: u32) {
        self.events.push(DummyEvent::Timestamp { slot, query_index });
    }

    fn resolve_timestamps(
        &mut self,
        _stream: &mut CommandStream<'_>,
        slot: u32,
        first_query: u32,
        query_count: u32,
    ) {
        self.events.push(DummyEvent::ResolveTimestamps {
            slot,
            first_query,
            query_count,
        });
    }

    fn read_timestamps(
        &mut self,
        _slot: u32,
        _first_query: u32,
        query_count: u32,
    ) -> Option<Vec<u64>> {
        // Fabricate a monotonic tick stream: 100 ticks between consecutive
        // timestamps of a frame.
        let base = self.ticks;
        self.ticks += 10_000;
        Some((0..query_count as u64).map(|i| base + i * 100).collect())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

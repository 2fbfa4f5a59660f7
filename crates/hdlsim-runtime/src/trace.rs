//! Host-side reader over the trace ring buffer.
//!
//! Each `tick2` iteration snapshots the output region (one trace record)
//! into the ring; the host walks records with a cursor that wraps exactly
//! like the generated `copy_trace_rec` writer.

use crate::error::{RuntimeError, SimResult};
use crate::proxy::{self, SignalValue};
use crate::runtime::HdlSim;

impl HdlSim {
    /// Bytes per trace record (the padded output region).
    pub fn trace_record_size(&self) -> u32 {
        self.globals().output_bytes
    }

    /// Rewind the read cursor to the start of the ring.
    pub fn reset_trace(&mut self) {
        self.trace_cursor = self.globals().trace_start;
    }

    /// Advance the read cursor one record, wrapping at the ring end.
    pub fn next_trace(&mut self) {
        let layout = self.globals();
        let rec = layout.output_bytes;
        if rec == 0 {
            return;
        }
        let (start, end) = (layout.trace_start, layout.trace_end);
        self.trace_cursor += rec;
        if self.trace_cursor >= end {
            self.trace_cursor = start;
        }
    }

    /// Read an output variable out of the record under the cursor.
    pub fn trace_get(&self, name: &str) -> SimResult<SignalValue> {
        let layout = self.globals();
        let entry = layout
            .lookup(name)
            .filter(|e| e.offset + e.size <= layout.output_bytes)
            .ok_or_else(|| RuntimeError::UnknownSignal(name.to_string()))?;
        let base = self.trace_cursor;
        let inst = self.inst.as_ref().ok_or(RuntimeError::NotInitialized)?;
        Ok(proxy::read(entry, base, inst.memory_data()))
    }
}

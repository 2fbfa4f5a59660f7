//! State layout.
//!
//! Every signal of the module is assigned a byte offset in one flat state
//! buffer:
//!
//! ```text
//! ┌───────────────────────────┐ 0
//! │ outputs (trace record)    │   padded to a multiple of 8
//! ├───────────────────────────┤ output_bytes
//! │ inputs + internal state   │   padded to 8
//! ├───────────────────────────┤ const_start
//! │ constants + constant pool │
//! │ string pool, promoted     │
//! │ locals                    │   padded to 8
//! ├───────────────────────────┤ meta_offset (== state_bytes)
//! │ TRACERECLEN TRACEOFS      │
//! │ TRACEEND (3 × u32)        │
//! ├───────────────────────────┤ trace_start
//! │ trace ring buffer         │
//! └───────────────────────────┘ trace_end
//! ```
//!
//! Entries are aligned to `min(8, next_power_of_two(size))`; wide entries are
//! contiguous little-endian 32-bit chunks.  The layout is built during
//! compilation (codegen may promote block-local declarations and intern
//! `$readmem` filename strings) and frozen by [`StateLayout::finalize`];
//! the runtime borrows it read-only afterwards.

use std::collections::HashMap;

use hdlsim_ir::{ConstVal, DataType, InitValue, ModuleDef};
use log::debug;

use crate::error::{CodegenError, CodegenResult};
use crate::types::{SimConfig, PAGE_BYTES, TRACE_META_BYTES};

/// One laid-out variable.
#[derive(Debug, Clone)]
pub struct LayoutEntry {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub dtype: DataType,
    /// Insertion index into the layout.
    pub index: u32,
    pub init_value: Option<InitValue>,
    pub const_value: Option<ConstVal>,
    /// Set when `_ctor_var_reset` zeroes this entry.
    pub reset_flag: bool,
}

/// The layout record for one module.
#[derive(Debug)]
pub struct StateLayout {
    entries: Vec<LayoutEntry>,
    by_name: HashMap<String, usize>,
    /// Current byte offset (next free byte).
    len: u32,
    /// Size of the output region; multiple of 8.  This is the trace record.
    pub output_bytes: u32,
    /// Offset where constants begin.
    pub const_start: u32,
    /// Offset of the three metadata words; equals the persisted state size.
    pub meta_offset: u32,
    /// First byte of the trace ring.
    pub trace_start: u32,
    /// One past the last byte of the trace ring.
    pub trace_end: u32,
    /// Linear memory size in pages (min == max).
    pub total_pages: u32,
    /// Interned NUL-terminated strings: (offset, content).
    strings: Vec<(u32, String)>,
    string_cache: HashMap<String, u32>,
    /// Interned inline wide constants, keyed by (width, value bytes).
    const_cache: HashMap<(u32, Vec<u8>), u32>,
    finalized: bool,
}

impl StateLayout {
    /// Lay out a module's variables (plus an optional shared constant pool).
    ///
    /// Outputs come first, padded to 8 so the trace-copy loop can use 64-bit
    /// stores; remaining non-constants follow sorted by size descending;
    /// constants and the pool close the persisted region.
    pub fn build(module: &ModuleDef, pool: Option<&ModuleDef>) -> CodegenResult<Self> {
        let mut layout = Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
            len: 0,
            output_bytes: 0,
            const_start: 0,
            meta_offset: 0,
            trace_start: 0,
            trace_end: 0,
            total_pages: 0,
            strings: Vec::new(),
            string_cache: HashMap::new(),
            const_cache: HashMap::new(),
            finalized: false,
        };

        let (consts, mut nonconsts): (Vec<_>, Vec<_>) = module
            .vardefs
            .iter()
            .partition(|v| v.const_value.is_some());

        // Outputs first, then by size descending; stable so ties keep
        // declaration order.
        nonconsts.sort_by_key(|v| (!v.is_output, std::cmp::Reverse(v.dtype.size_bytes())));

        let mut saw_internal = false;
        for v in &nonconsts {
            if v.is_output {
                debug_assert!(!saw_internal, "outputs must precede internal state");
                layout.emplace(&v.name, v.dtype.clone(), v.init_value.clone(), None)?;
            } else {
                if !saw_internal {
                    layout.pad_to(8);
                    layout.output_bytes = layout.len;
                    saw_internal = true;
                }
                layout.emplace(&v.name, v.dtype.clone(), v.init_value.clone(), None)?;
            }
        }
        if !saw_internal {
            // All variables are outputs (or there are none).
            layout.pad_to(8);
            layout.output_bytes = layout.len;
        }

        layout.pad_to(8);
        layout.const_start = layout.len;
        for v in consts {
            layout.emplace(
                &v.name,
                v.dtype.clone(),
                v.init_value.clone(),
                v.const_value.clone(),
            )?;
        }
        if let Some(pool) = pool {
            for v in &pool.vardefs {
                layout.emplace(
                    &v.name,
                    v.dtype.clone(),
                    v.init_value.clone(),
                    v.const_value.clone(),
                )?;
            }
        }
        layout.pad_to(8);

        Ok(layout)
    }

    fn pad_to(&mut self, align: u32) {
        self.len = self.len.next_multiple_of(align);
    }

    /// Assign an offset to a variable.  Fails on duplicate names.
    fn emplace(
        &mut self,
        name: &str,
        dtype: DataType,
        init_value: Option<InitValue>,
        const_value: Option<ConstVal>,
    ) -> CodegenResult<u32> {
        if self.by_name.contains_key(name) {
            return Err(CodegenError::Internal(format!(
                "duplicate variable in layout: {name}"
            )));
        }
        let size = dtype.size_bytes();
        self.pad_to(dtype.align());
        let offset = self.len;
        let index = self.entries.len() as u32;
        self.entries.push(LayoutEntry {
            name: name.to_string(),
            offset,
            size,
            dtype,
            index,
            init_value,
            const_value,
            reset_flag: false,
        });
        self.by_name.insert(name.to_string(), index as usize);
        self.len += size;
        Ok(offset)
    }

    /// Promote a reference-sized block-local declaration into the state
    /// region.  Only legal before [`finalize`](Self::finalize).
    pub fn promote(&mut self, name: &str, dtype: DataType) -> CodegenResult<u32> {
        debug_assert!(!self.finalized);
        self.emplace(name, dtype, None, None)
    }

    /// Intern an inline wide constant operand into the constant region so
    /// chunked code can address it; returns its offset.
    pub fn intern_const(
        &mut self,
        dtype: DataType,
        cv: &ConstVal,
    ) -> CodegenResult<u32> {
        debug_assert!(!self.finalized);
        let key = (dtype.width(), cv.value_big().to_bytes_le());
        if let Some(&offset) = self.const_cache.get(&key) {
            return Ok(offset);
        }
        let name = format!("$$const{}", self.entries.len());
        let offset = self.emplace(&name, dtype, None, Some(cv.clone()))?;
        self.const_cache.insert(key, offset);
        Ok(offset)
    }

    /// Intern a NUL-terminated string constant; returns its offset.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        debug_assert!(!self.finalized);
        if let Some(&offset) = self.string_cache.get(s) {
            return offset;
        }
        let offset = self.len;
        self.len += s.len() as u32 + 1;
        self.strings.push((offset, s.to_string()));
        self.string_cache.insert(s.to_string(), offset);
        offset
    }

    /// Interned strings as (offset, content) pairs.
    pub fn strings(&self) -> &[(u32, String)] {
        &self.strings
    }

    /// Append the metadata trailer and the trace ring, compute the page
    /// count, and freeze the layout.
    pub fn finalize(&mut self, config: &SimConfig) -> CodegenResult<()> {
        self.pad_to(8);
        self.meta_offset = self.len;
        self.len += TRACE_META_BYTES;
        self.pad_to(8);
        self.trace_start = self.len;
        self.len += config.trace_depth * self.output_bytes;
        self.trace_end = self.len;

        let need = self.len as u64;
        let cap = config.max_memory_bytes();
        if need > cap {
            return Err(CodegenError::MemoryLimitExceeded { need, cap });
        }
        self.total_pages = self.len.div_ceil(PAGE_BYTES).max(1);
        self.finalized = true;
        debug!(
            "layout: {} vars, {} state bytes ({} output), {} pages",
            self.entries.len(),
            self.meta_offset,
            self.output_bytes,
            self.total_pages
        );
        Ok(())
    }

    /// Persisted state size in bytes (outputs + internal + constants).
    pub fn state_bytes(&self) -> u32 {
        self.meta_offset
    }

    /// Look up an entry by name.
    pub fn lookup(&self, name: &str) -> Option<&LayoutEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub(crate) fn lookup_mut(&mut self, name: &str) -> Option<&mut LayoutEntry> {
        self.by_name.get(name).map(|&i| &mut self.entries[i])
    }

    /// All entries in layout order.
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Entries inside the output region, i.e. the trace record.
    pub fn output_entries(&self) -> impl Iterator<Item = &LayoutEntry> {
        let end = self.output_bytes;
        self.entries.iter().filter(move |e| e.offset < end && e.size > 0)
    }
}

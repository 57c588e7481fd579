//! Trace/stat sink (C9).
//!
//! Out of scope per spec §1 beyond "the core emits trace events through an
//! opaque sink" — this module is that sink's interface plus a minimal
//! file-backed implementation, kept deliberately small (~2% of the budget
//! per spec §2's component table).

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use bitflags::bitflags;

bitflags! {
    /// Trace event categories, matched against `TRACEMASK`/`STATSMASK`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceMask: u32 {
        const AM = 1 << 0;
        const BARRIER = 1 << 1;
        const FIREHOSE = 1 << 2;
        const CONNECTION = 1 << 3;
        const PUTGET = 1 << 4;
    }
}

/// A formatted event stream with a category mask, mirroring `gasnet_trace.c`'s
/// role as "best-effort, unaffected by any error path" (spec §7).
pub struct TraceSink {
    mask: u32,
    file: Option<Mutex<File>>,
}

impl TraceSink {
    pub fn new(mask: u32, path: Option<&str>) -> Self {
        let file = path.and_then(|p| File::create(p).ok()).map(Mutex::new);
        TraceSink { mask, file }
    }

    pub fn disabled() -> Self {
        TraceSink {
            mask: 0,
            file: None,
        }
    }

    #[inline]
    pub fn enabled(&self, category: TraceMask) -> bool {
        self.mask & category.bits() != 0
    }

    /// Emit a trace line. Best-effort: an I/O failure here never propagates.
    pub fn emit(&self, category: TraceMask, args: fmt::Arguments<'_>) {
        if !self.enabled(category) {
            return;
        }
        log::trace!("{args}");
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{args}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_gating() {
        let sink = TraceSink::new(TraceMask::AM.bits(), None);
        assert!(sink.enabled(TraceMask::AM));
        assert!(!sink.enabled(TraceMask::FIREHOSE));
    }
}

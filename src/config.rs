//! Engine-wide tuning knobs.
//!
//! Unlike the typestate builder used elsewhere in this crate, `EngineConfig` has no construction
//! ordering to enforce — a plain struct with chainable setters is all three fields need.

/// Options governing how an [`crate::engine::Engine`] treats CRC mismatches, oversized buffers,
/// and overlapping matches.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Convert an otherwise-valid `Emit` into a resync when the trailing CRC field doesn't check
    /// out. `false` delivers the record regardless, with the verdict attached for the sink to
    /// act on.
    pub strict_crc: bool,
    /// Hard cap on buffered bytes per attempt. `0` means "no caller-imposed ceiling" — the
    /// pattern's own `$N` hint (if any) still applies. When both are set, the smaller wins.
    pub max_length_ceiling: usize,
    /// After a successful match, also probe the same buffer at later start offsets for
    /// overlapping matches of the same pattern. Useful when a stream occasionally drifts and a
    /// resynchronization view into the raw bytes is wanted alongside the primary decode.
    pub alternative_matches: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strict_crc: false,
            max_length_ceiling: 0,
            alternative_matches: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict_crc(mut self, strict: bool) -> Self {
        self.strict_crc = strict;
        self
    }

    pub fn with_max_length_ceiling(mut self, ceiling: usize) -> Self {
        self.max_length_ceiling = ceiling;
        self
    }

    pub fn with_alternative_matches(mut self, enabled: bool) -> Self {
        self.alternative_matches = enabled;
        self
    }

    /// The effective cap this config and a program's own `$N` hint agree on, or `0` for "no cap".
    pub fn effective_max_length(&self, program_max_length: usize) -> usize {
        match (self.max_length_ceiling, program_max_length) {
            (0, 0) => 0,
            (0, p) => p,
            (c, 0) => c,
            (c, p) => c.min(p),
        }
    }
}

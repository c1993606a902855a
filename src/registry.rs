//! Opt-in cache from pattern text to compiled [`Program`]s.
//!
//! Exercises the note in `SPEC_FULL.md` §9: "the only process-wide state is the optional program
//! registry the caller may maintain; the engine itself is fully parameter-driven and carries no
//! hidden state." A caller juggling many patterns across many streams can use this to compile
//! each pattern exactly once instead of threading its own cache through.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CompileError;
use crate::pattern::{self, Program};

/// A cache of compiled programs, keyed by their source pattern text. Programs are handed out as
/// `Arc<Program>` so callers can hold a compiled pattern across threads or past the registry's
/// own lifetime without cloning the tree (`SPEC_FULL.md` §4.11).
#[derive(Debug, Default)]
pub struct ProgramRegistry {
    compiled: HashMap<String, Arc<Program>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the program for `pattern`, compiling and caching it on first use. A second call
    /// with the same pattern text returns the same `Arc` pointer rather than a fresh clone.
    pub fn get_or_compile(&mut self, pattern: &str) -> Result<Arc<Program>, CompileError> {
        if !self.compiled.contains_key(pattern) {
            let program = pattern::compile(pattern)?;
            tracing::debug!(pattern, "compiled and cached new program");
            self.compiled.insert(pattern.to_string(), Arc::new(program));
        }
        Ok(Arc::clone(self.compiled.get(pattern).expect("just inserted")))
    }

    /// The program for `pattern` if it has already been compiled, without compiling it.
    pub fn get(&self, pattern: &str) -> Option<Arc<Program>> {
        self.compiled.get(pattern).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    pub fn clear(&mut self) {
        self.compiled.clear();
    }
}

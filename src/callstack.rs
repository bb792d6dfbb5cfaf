//! Call stack interning and raw-to-resolved mapping
//!
//! Raw stacks arrive leaf first from the samplers and are deduplicated by a
//! hash of the full frame sequence. During processing, each raw stack is
//! resolved by replacing every address with the start address of its
//! containing function; stacks differing only by intra-function offsets then
//! collapse onto one resolved identity. Addresses with no symbol stay
//! verbatim so call-site context is not lost.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::domain::CallstackId;
use crate::symbols::SymbolProvider;

/// An ordered sequence of instruction pointers, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStack {
    pub frames: Vec<u64>,
}

impl CallStack {
    #[must_use]
    pub fn new(frames: Vec<u64>) -> Self {
        Self { frames }
    }

    /// Identity of this stack: a hash of the frame sequence. Deterministic
    /// for the lifetime of the interner.
    #[must_use]
    pub fn id(&self) -> CallstackId {
        let mut hasher = DefaultHasher::new();
        self.frames.hash(&mut hasher);
        CallstackId(hasher.finish())
    }

    #[must_use]
    pub fn leaf(&self) -> Option<u64> {
        self.frames.first().copied()
    }
}

#[derive(Default)]
pub struct CallStackInterner {
    /// Raw stacks by id. Written concurrently by the sample producers.
    unique: Mutex<HashMap<CallstackId, Arc<CallStack>>>,
    /// Resolved stacks by id. Only touched during processing.
    resolved: HashMap<CallstackId, Arc<CallStack>>,
    raw_to_resolved: HashMap<CallstackId, CallstackId>,
}

impl CallStackInterner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicate a raw stack, returning its stable identifier.
    pub fn intern_raw(&self, frames: Vec<u64>) -> CallstackId {
        let stack = CallStack::new(frames);
        let id = stack.id();
        self.unique.lock().unwrap().entry(id).or_insert_with(|| Arc::new(stack));
        id
    }

    #[must_use]
    pub fn raw(&self, id: CallstackId) -> Option<Arc<CallStack>> {
        self.unique.lock().unwrap().get(&id).cloned()
    }

    #[must_use]
    pub fn resolved(&self, id: CallstackId) -> Option<Arc<CallStack>> {
        self.resolved.get(&id).cloned()
    }

    #[must_use]
    pub fn unique_count(&self) -> usize {
        self.unique.lock().unwrap().len()
    }

    /// Map a raw stack onto its resolved identity, memoised. Each frame is
    /// replaced by the start address of the function containing it; frames
    /// the provider cannot place are kept as-is and counted in `misses`.
    pub fn resolve(
        &mut self,
        raw_id: CallstackId,
        symbols: &dyn SymbolProvider,
        misses: &mut u64,
    ) -> CallstackId {
        if let Some(resolved_id) = self.raw_to_resolved.get(&raw_id) {
            return *resolved_id;
        }

        let Some(raw) = self.unique.get_mut().unwrap().get(&raw_id).cloned() else {
            // Unknown id resolves to itself; nothing to translate.
            return raw_id;
        };

        let frames = raw
            .frames
            .iter()
            .map(|&addr| match symbols.resolve(addr) {
                Some(symbol) => symbol.start,
                None => {
                    *misses += 1;
                    addr
                }
            })
            .collect();

        let resolved = CallStack::new(frames);
        let resolved_id = resolved.id();
        self.resolved.entry(resolved_id).or_insert_with(|| Arc::new(resolved));
        self.raw_to_resolved.insert(raw_id, resolved_id);
        resolved_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::StaticSymbolProvider;

    #[test]
    fn test_intern_is_deterministic() {
        let interner = CallStackInterner::new();
        let a = interner.intern_raw(vec![0x100, 0x200, 0x300]);
        let b = interner.intern_raw(vec![0x100, 0x200, 0x300]);
        assert_eq!(a, b);
        assert_eq!(interner.unique_count(), 1);
    }

    #[test]
    fn test_distinct_stacks_get_distinct_ids() {
        let interner = CallStackInterner::new();
        let a = interner.intern_raw(vec![0x100, 0x200, 0x300]);
        let c = interner.intern_raw(vec![0x101, 0x200, 0x300]);
        assert_ne!(a, c);
        assert_eq!(interner.unique_count(), 2);
    }

    #[test]
    fn test_resolve_collapses_intra_function_offsets() {
        let mut interner = CallStackInterner::new();
        // 0x100..0x110 is one function; 0x100 and 0x101 share a start
        let symbols = StaticSymbolProvider::new(vec![
            (0x100, 0x10, "alpha"),
            (0x200, 0x10, "beta"),
            (0x300, 0x10, "gamma"),
        ]);

        let s1 = interner.intern_raw(vec![0x100, 0x200, 0x300]);
        let s3 = interner.intern_raw(vec![0x101, 0x200, 0x300]);
        assert_ne!(s1, s3);

        let mut misses = 0;
        let r1 = interner.resolve(s1, &symbols, &mut misses);
        let r3 = interner.resolve(s3, &symbols, &mut misses);
        assert_eq!(r1, r3);
        assert_eq!(misses, 0);
        assert_eq!(interner.resolved(r1).unwrap().frames, vec![0x100, 0x200, 0x300]);
    }

    #[test]
    fn test_resolve_keeps_unknown_addresses() {
        let mut interner = CallStackInterner::new();
        let symbols = StaticSymbolProvider::new(vec![(0x100, 0x10, "alpha")]);

        let raw = interner.intern_raw(vec![0x105, 0xdead_beef]);
        let mut misses = 0;
        let resolved = interner.resolve(raw, &symbols, &mut misses);
        assert_eq!(misses, 1);
        assert_eq!(interner.resolved(resolved).unwrap().frames, vec![0x100, 0xdead_beef]);
    }

    #[test]
    fn test_resolve_is_memoised() {
        let mut interner = CallStackInterner::new();
        let symbols = StaticSymbolProvider::new(vec![(0x100, 0x10, "alpha")]);
        let raw = interner.intern_raw(vec![0x105]);

        let mut misses = 0;
        let first = interner.resolve(raw, &symbols, &mut misses);
        let second = interner.resolve(raw, &symbols, &mut misses);
        assert_eq!(first, second);
        assert_eq!(misses, 0);
    }

    #[test]
    fn test_concurrent_interning() {
        let interner = Arc::new(CallStackInterner::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interner = Arc::clone(&interner);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        interner.intern_raw(vec![i, i + 1]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(interner.unique_count(), 100);
    }
}

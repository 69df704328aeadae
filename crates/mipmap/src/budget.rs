/// Answers how far the cache is over its memory allowance.
pub trait MemoryBudget: Send + Sync + 'static {
    /// Bytes that should be released, given the bytes the cache currently holds.
    fn overallocated_bytes(&self, resident_bytes: u64) -> u64;
}

/// Fixed ceiling on resident level bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentBytesBudget {
    pub limit_bytes: u64,
}

impl ResidentBytesBudget {
    pub const fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes }
    }
}

impl MemoryBudget for ResidentBytesBudget {
    fn overallocated_bytes(&self, resident_bytes: u64) -> u64 {
        resident_bytes.saturating_sub(self.limit_bytes)
    }
}

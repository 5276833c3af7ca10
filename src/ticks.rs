/// Retired-conditional-branch counts. Used as the deterministic logical
/// clock identifying execution positions across record and replay.
pub type Ticks = u64;

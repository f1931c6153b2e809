//! Memory accounting for cached tile imagery
//!
//! Tracks how many bytes of decoded pixels the cache holds and turns that into
//! a pressure metric the controller uses to pull the next sweep forward.

/// Pressure above which the cache should be swept ahead of schedule.
pub const SWEEP_PRESSURE: f32 = 0.9;

const MIB: usize = 1024 * 1024;

/// Byte budget for decoded tile images
#[derive(Clone, Debug)]
pub struct MemoryBudget {
    /// Maximum bytes the cache should hold
    budget_bytes: usize,
    /// Bytes currently held
    used_bytes: usize,
}

impl MemoryBudget {
    /// Create a new memory budget
    ///
    /// # Arguments
    /// * `budget_mb` - Maximum tile memory in megabytes
    pub fn new(budget_mb: usize) -> Self {
        Self {
            budget_bytes: budget_mb.saturating_mul(MIB),
            used_bytes: 0,
        }
    }

    /// Record bytes added to the cache
    pub fn add(&mut self, bytes: usize) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }

    /// Record bytes released from the cache
    pub fn remove(&mut self, bytes: usize) {
        self.used_bytes = self.used_bytes.saturating_sub(bytes);
    }

    pub fn used(&self) -> usize {
        self.used_bytes
    }

    pub fn available(&self) -> usize {
        self.budget_bytes.saturating_sub(self.used_bytes)
    }

    pub fn used_mib(&self) -> f32 {
        self.used_bytes as f32 / MIB as f32
    }

    /// Fraction of the budget in use (0.0 to 1.0+)
    ///
    /// Values above 1.0 indicate over-budget. A zero budget never reports
    /// pressure.
    pub fn pressure(&self) -> f32 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f32 / self.budget_bytes as f32
    }

    /// Whether the cache should be swept before its regular cadence
    pub fn should_sweep(&self) -> bool {
        self.pressure() > SWEEP_PRESSURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_new() {
        let budget = MemoryBudget::new(512);
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.available(), 512 * MIB);
    }

    #[test]
    fn test_budget_add_remove() {
        let mut budget = MemoryBudget::new(512);
        budget.add(100 * MIB);
        assert_eq!(budget.used(), 100 * MIB);
        assert_eq!(budget.available(), 412 * MIB);

        budget.remove(50 * MIB);
        assert_eq!(budget.used(), 50 * MIB);
        assert!((budget.used_mib() - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_budget_saturating_ops() {
        let mut budget = MemoryBudget::new(512);

        // Removing more than held should saturate at 0
        budget.remove(1000 * MIB);
        assert_eq!(budget.used(), 0);

        budget.add(usize::MAX);
        budget.add(100);
        assert_eq!(budget.used(), usize::MAX);
    }

    #[test]
    fn test_budget_pressure() {
        let mut budget = MemoryBudget::new(100);
        assert_eq!(budget.pressure(), 0.0);

        budget.add(50 * MIB);
        assert!((budget.pressure() - 0.5).abs() < 0.01);
        assert!(!budget.should_sweep());

        budget.add(45 * MIB);
        assert!((budget.pressure() - 0.95).abs() < 0.01);
        assert!(budget.should_sweep());
    }

    #[test]
    fn test_budget_zero_budget_pressure() {
        let mut budget = MemoryBudget::new(0);
        budget.add(10 * MIB);
        assert_eq!(budget.pressure(), 0.0);
        assert!(!budget.should_sweep());
    }

    #[test]
    fn test_budget_tile_scenario() {
        // 64 MB holds exactly 256 standard tiles
        let mut budget = MemoryBudget::new(64);
        let tile_bytes = 256 * 256 * 4;
        for _ in 0..230 {
            budget.add(tile_bytes);
        }
        assert!(!budget.should_sweep());
        for _ in 0..10 {
            budget.add(tile_bytes);
        }
        assert!(budget.should_sweep());
    }
}

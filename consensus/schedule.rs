//! Penalty and solver-tolerance schedules across ADMM iterations.

/// Rho used when a lambda has no configured rho.
pub fn default_rho(lambda: f64) -> f64 {
    if lambda <= 100.0 { 1.0 } else { 10.0 }
}

/// Exponential rho decay plus the one-off boost after mean-model
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RhoSchedule {
    pub adapt_coefficient: f64,
    pub boost_rate: f64,
}

impl Default for RhoSchedule {
    fn default() -> Self {
        Self {
            adapt_coefficient: 0.0,
            boost_rate: 0.0,
        }
    }
}

impl RhoSchedule {
    /// `base * exp(-(i - 1) * coefficient)`, multiplied by the boost rate at
    /// the first iteration of a warm-started run.
    pub fn effective(&self, base: f64, iteration: usize, boosted: bool) -> f64 {
        let steps = iteration.saturating_sub(1) as f64;
        let mut rho = base * (-steps * self.adapt_coefficient).exp();
        if boosted && iteration == 1 && self.boost_rate > 0.0 {
            rho *= self.boost_rate;
        }
        rho
    }
}

/// Mindiff below which progress counts as stalled.
pub const STALL_THRESHOLD: f64 = 0.001;

/// Geometric annealing of the per-block solver tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceSchedule {
    current: f64,
    floor: f64,
    aggressive: bool,
}

impl ToleranceSchedule {
    pub fn new(initial: f64, floor: f64, aggressive: bool) -> Self {
        Self {
            current: initial,
            floor,
            aggressive,
        }
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    /// Tolerance for iteration `i`. Without aggressive decay it tightens
    /// tenfold when the previous iteration stalled (from the second iteration
    /// on); with aggressive decay it tightens on every iteration after the
    /// fifth and ignores stalls.
    pub fn advance(&mut self, iteration: usize, last_mindiff: Option<f64>) -> f64 {
        let stalled = iteration > 1 && last_mindiff.is_some_and(|d| d < STALL_THRESHOLD);
        let tighten = if self.aggressive {
            iteration > 5
        } else {
            stalled
        };
        if tighten {
            self.current /= 10.0;
        }
        self.current
    }

    /// Repeated division by ten drifts in the last bits; compare with slack.
    pub fn at_floor(&self) -> bool {
        self.current <= self.floor * (1.0 + 1e-9)
    }
}

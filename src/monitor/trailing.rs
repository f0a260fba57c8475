// =============================================================================
// Trailing Stops — ratcheting stop-loss state in three modes
// =============================================================================
//
// FIXED — the stop follows the high-water (longs) or low-water (shorts) mark
// at a constant distance.
// STEP  — like FIXED, but the stop only advances in whole multiples of
// `step_size`.
// ATR   — the distance is recomputed on every evaluation as ATR(14) times
// `multiplier`; when no ATR is available the configured distance is the
// fallback.
//
// Invariant: the stop never retreats. Lifetime is bound to the parent
// position; the struct is embedded in it and dies with it.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrailingMode {
    Fixed,
    Step,
    Atr,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Client-supplied trailing parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TrailingConfig {
    pub mode: TrailingMode,
    /// Stop distance in price units (base distance for ATR mode).
    pub distance: f64,
    /// Advance granularity for STEP mode.
    #[serde(default)]
    pub step_size: f64,
    /// ATR multiplier for ATR mode.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Live trailing state embedded in a position.
#[derive(Debug, Clone, Serialize)]
pub struct TrailingStop {
    pub mode: TrailingMode,
    pub distance: f64,
    pub step_size: f64,
    pub multiplier: f64,
    pub high_water: f64,
    pub low_water: f64,
    pub current_sl: f64,
    pub active: bool,
}

impl TrailingStop {
    /// Initialize from the open price. When the position already carries an
    /// SL it becomes the trail's starting level; otherwise the level starts
    /// one distance away from the open.
    pub fn new(cfg: TrailingConfig, side: Side, open_price: f64, existing_sl: Option<f64>) -> Self {
        let current_sl = existing_sl.unwrap_or(match side {
            Side::Buy => open_price - cfg.distance,
            Side::Sell => open_price + cfg.distance,
        });
        Self {
            mode: cfg.mode,
            distance: cfg.distance,
            step_size: cfg.step_size,
            multiplier: cfg.multiplier,
            high_water: open_price,
            low_water: open_price,
            current_sl,
            active: true,
        }
    }

    pub fn uses_atr(&self) -> bool {
        self.mode == TrailingMode::Atr
    }

    /// Whether the position's SL is the one this trail manages, so trigger
    /// attribution can say TRAILING_STOP rather than STOP_LOSS.
    pub fn owns_level(&self, sl: Option<f64>) -> bool {
        self.active && sl.map_or(false, |s| (s - self.current_sl).abs() < 1e-9)
    }

    fn effective_distance(&self, atr: Option<f64>) -> f64 {
        match self.mode {
            TrailingMode::Atr => atr
                .filter(|a| *a > 0.0)
                .map(|a| a * self.multiplier)
                .unwrap_or(self.distance),
            _ => self.distance,
        }
    }

    /// Evaluate against the current book; returns the new stop level when it
    /// advanced. Water marks update on favorable movement only, and the stop
    /// never retreats even when the ATR distance widens.
    pub fn advance(&mut self, side: Side, bid: f64, ask: f64, atr: Option<f64>) -> Option<f64> {
        if !self.active {
            return None;
        }
        let dist = self.effective_distance(atr);

        match side {
            Side::Buy => {
                if bid > self.high_water {
                    self.high_water = bid;
                }
                let candidate = self.high_water - dist;
                let advanced = match self.mode {
                    TrailingMode::Step => {
                        if self.step_size <= 0.0 {
                            candidate
                        } else {
                            let steps = ((candidate - self.current_sl) / self.step_size).floor();
                            if steps < 1.0 {
                                return None;
                            }
                            self.current_sl + steps * self.step_size
                        }
                    }
                    _ => candidate,
                };
                if advanced > self.current_sl + 1e-12 {
                    self.current_sl = advanced;
                    Some(advanced)
                } else {
                    None
                }
            }
            Side::Sell => {
                if ask < self.low_water {
                    self.low_water = ask;
                }
                let candidate = self.low_water + dist;
                let advanced = match self.mode {
                    TrailingMode::Step => {
                        if self.step_size <= 0.0 {
                            candidate
                        } else {
                            let steps = ((self.current_sl - candidate) / self.step_size).floor();
                            if steps < 1.0 {
                                return None;
                            }
                            self.current_sl - steps * self.step_size
                        }
                    }
                    _ => candidate,
                };
                if advanced < self.current_sl - 1e-12 {
                    self.current_sl = advanced;
                    Some(advanced)
                } else {
                    None
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(distance: f64) -> TrailingConfig {
        TrailingConfig {
            mode: TrailingMode::Fixed,
            distance,
            step_size: 0.0,
            multiplier: 1.0,
        }
    }

    #[test]
    fn fixed_trail_follows_high_water_long() {
        let mut t = TrailingStop::new(fixed(0.0010), Side::Buy, 1.1000, None);
        assert!((t.current_sl - 1.0990).abs() < 1e-9);

        // Price rallies: stop ratchets up.
        let sl = t.advance(Side::Buy, 1.1020, 1.1021, None).unwrap();
        assert!((sl - 1.1010).abs() < 1e-9);

        // Price retraces: stop holds.
        assert!(t.advance(Side::Buy, 1.1005, 1.1006, None).is_none());
        assert!((t.current_sl - 1.1010).abs() < 1e-9);
    }

    #[test]
    fn fixed_trail_follows_low_water_short() {
        let mut t = TrailingStop::new(fixed(0.0010), Side::Sell, 1.1000, None);
        assert!((t.current_sl - 1.1010).abs() < 1e-9);

        let sl = t.advance(Side::Sell, 1.0979, 1.0980, None).unwrap();
        assert!((sl - 1.0990).abs() < 1e-9);

        // Bounce: stop never retreats upward.
        assert!(t.advance(Side::Sell, 1.0994, 1.0995, None).is_none());
        assert!((t.current_sl - 1.0990).abs() < 1e-9);
    }

    #[test]
    fn step_trail_advances_in_whole_steps() {
        let cfg = TrailingConfig {
            mode: TrailingMode::Step,
            distance: 0.0010,
            step_size: 0.0005,
            multiplier: 1.0,
        };
        let mut t = TrailingStop::new(cfg, Side::Buy, 1.1000, None);
        assert!((t.current_sl - 1.0990).abs() < 1e-9);

        // +3 pips favorable: candidate 1.0993, only 0.0003 above — under one
        // step, no advance.
        assert!(t.advance(Side::Buy, 1.1003, 1.1004, None).is_none());

        // +7 pips: candidate 1.0997 — one whole step (0.0005) fits.
        let sl = t.advance(Side::Buy, 1.1007, 1.1008, None).unwrap();
        assert!((sl - 1.0995).abs() < 1e-9);
    }

    #[test]
    fn atr_trail_recomputes_distance() {
        let cfg = TrailingConfig {
            mode: TrailingMode::Atr,
            distance: 0.0010,
            step_size: 0.0,
            multiplier: 2.0,
        };
        let mut t = TrailingStop::new(cfg, Side::Buy, 1.1000, None);

        // ATR 0.0004 * 2.0 = 0.0008 distance.
        let sl = t.advance(Side::Buy, 1.1010, 1.1011, Some(0.0004)).unwrap();
        assert!((sl - 1.1002).abs() < 1e-9);

        // ATR widens: candidate falls below the stop — no retreat.
        assert!(t.advance(Side::Buy, 1.1010, 1.1011, Some(0.0010)).is_none());
        assert!((t.current_sl - 1.1002).abs() < 1e-9);

        // No ATR available: configured distance is the fallback.
        let sl = t.advance(Side::Buy, 1.1020, 1.1021, None).unwrap();
        assert!((sl - 1.1010).abs() < 1e-9);
    }

    #[test]
    fn existing_sl_seeds_the_trail() {
        let t = TrailingStop::new(fixed(0.0010), Side::Buy, 1.1000, Some(1.0950));
        assert!((t.current_sl - 1.0950).abs() < 1e-9);
        assert!(t.owns_level(Some(1.0950)));
        assert!(!t.owns_level(Some(1.0951)));
        assert!(!t.owns_level(None));
    }
}

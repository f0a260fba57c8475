// =============================================================================
// Average True Range (ATR)
// =============================================================================
//
// Volatility estimate over minute bars aggregated from stored tick mids. The
// true range of a bar extends its high-low span to cover any gap against the
// previous close; Wilder's recurrence then smooths the series:
//
//   atr <- atr + (tr - atr) / period
//
// seeded with the plain average of the first `period` true ranges. The ATR
// trailing-stop mode multiplies the result into its stop distance.
// =============================================================================

use crate::market_data::Bar;

/// Standard look-back used by the trailing-stop evaluator.
pub const DEFAULT_ATR_PERIOD: usize = 14;

/// Bar range widened to absorb gaps against the previous close.
fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    let span = bar.high - bar.low;
    span.max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Latest ATR over `bars` (oldest first), or `None` when `period` is zero,
/// fewer than `period + 1` bars are available (each true range needs a
/// predecessor), or the inputs are not finite.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() <= period {
        return None;
    }
    // `f64::max` swallows NaN operands, so a poisoned bar must be caught
    // before it silently narrows a true range.
    if bars
        .iter()
        .any(|b| !(b.high.is_finite() && b.low.is_finite() && b.close.is_finite()))
    {
        return None;
    }

    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    let (warmup, tail) = ranges.split_at(period);
    let seed = warmup.iter().sum::<f64>() / period as f64;
    let atr = tail
        .iter()
        .fold(seed, |acc, tr| acc + (tr - acc) / period as f64);

    atr.is_finite().then_some(atr)
}

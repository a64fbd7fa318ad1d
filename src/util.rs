//! Small internal utilities.

/// Integer division, rounding up.
pub(crate) const fn div_up(n: usize, by: usize) -> usize {
    (n + by - 1) / by
}

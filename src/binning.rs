/// Division strategy selected by [`FastBinning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinningMode {
    /// Every dividend is smaller than the divisor.
    ConstZero,
    /// Divisor of one.
    Identity,
    /// Power-of-two divisor, right shift.
    Shift,
    /// 32-bit fixed-point multiply-high.
    MulHigh32,
    /// 64-bit fixed-point multiply-high.
    MulHigh64,
    /// Plain hardware division.
    Divide,
}

/// Exact division by a constant divisor over a bounded dividend range.
///
/// Construction inspects the divisor and the maximum dividend and picks the
/// cheapest method that reproduces `x / divisor` exactly for every
/// `0 <= x <= max_dividend`. The hot paths of the binned measurements call
/// `divide` once per click.
#[derive(Debug, Clone, Copy)]
pub struct FastBinning {
    divisor: u64,
    max_dividend: u64,
    factor: u64,
    shift: u32,
    mode: BinningMode,
}

impl FastBinning {
    pub fn new(divisor: u64, max_dividend: u64) -> Self {
        assert!(divisor > 0, "divisor must be nonzero");
        let (mode, factor, shift) = if max_dividend < divisor {
            (BinningMode::ConstZero, 0, 0)
        } else if divisor == 1 {
            (BinningMode::Identity, 0, 0)
        } else if divisor.is_power_of_two() {
            (BinningMode::Shift, 0, divisor.trailing_zeros())
        } else if let Some(factor) = fixed_point_factor(32, divisor, max_dividend) {
            (BinningMode::MulHigh32, factor, 0)
        } else if let Some(factor) = fixed_point_factor(64, divisor, max_dividend) {
            (BinningMode::MulHigh64, factor, 0)
        } else {
            (BinningMode::Divide, 0, 0)
        };
        Self {
            divisor,
            max_dividend,
            factor,
            shift,
            mode,
        }
    }

    pub fn mode(&self) -> BinningMode {
        self.mode
    }

    #[inline]
    pub fn divide(&self, dividend: u64) -> u64 {
        debug_assert!(dividend <= self.max_dividend);
        match self.mode {
            BinningMode::ConstZero => 0,
            BinningMode::Identity => dividend,
            BinningMode::Shift => dividend >> self.shift,
            BinningMode::MulHigh32 => (dividend * self.factor) >> 32,
            BinningMode::MulHigh64 => {
                ((dividend as u128 * self.factor as u128) >> 64) as u64
            }
            BinningMode::Divide => dividend / self.divisor,
        }
    }
}

/// Round-up fixed-point factor `ceil(2^bits / divisor)`, returned only when
/// the multiply-high result is provably exact over the dividend range: with
/// `e = factor * divisor - 2^bits`, exactness holds whenever
/// `e * max_dividend < 2^bits`.
fn fixed_point_factor(bits: u32, divisor: u64, max_dividend: u64) -> Option<u64> {
    let base: u128 = 1u128 << bits;
    if bits == 32 && max_dividend > u32::MAX as u64 {
        return None;
    }
    let factor = (base + divisor as u128 - 1) / divisor as u128;
    if factor > u64::MAX as u128 {
        return None;
    }
    let error = factor * divisor as u128 - base;
    if error * max_dividend as u128 >= base {
        return None;
    }
    Some(factor as u64)
}

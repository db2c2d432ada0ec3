use tagstream::{BinningMode, FastBinning};

fn check_exact(divisor: u64, max: u64) {
    let binning = FastBinning::new(divisor, max);
    let step = (max / 10_000).max(1);
    let mut x = 0;
    while x <= max {
        assert_eq!(
            binning.divide(x),
            x / divisor,
            "divisor {divisor}, dividend {x}, mode {:?}",
            binning.mode()
        );
        x += step;
    }
    // Edges around multiples of the divisor are the interesting cases.
    for quotient in [1u64, 2, max / divisor / 2, max / divisor] {
        for probe in [
            quotient.saturating_mul(divisor).saturating_sub(1),
            quotient.saturating_mul(divisor),
            quotient.saturating_mul(divisor).saturating_add(1),
        ] {
            if probe <= max {
                assert_eq!(binning.divide(probe), probe / divisor);
            }
        }
    }
    assert_eq!(binning.divide(max), max / divisor);
}

#[test]
fn all_modes_divide_exactly() {
    for divisor in [1, 2, 3, 7, 10, 1_000, 1_024, 999_983, 1 << 33] {
        for max in [1, 100, 65_536, 1 << 32, 1 << 45] {
            check_exact(divisor, max);
        }
    }
}

#[test]
fn mode_selection_prefers_the_cheap_paths() {
    assert_eq!(FastBinning::new(1_000, 10).mode(), BinningMode::ConstZero);
    assert_eq!(FastBinning::new(1, 1 << 40).mode(), BinningMode::Identity);
    assert_eq!(FastBinning::new(1 << 12, 1 << 40).mode(), BinningMode::Shift);
    assert_eq!(FastBinning::new(1_000, 1 << 20).mode(), BinningMode::MulHigh32);
    assert_eq!(FastBinning::new(1_000, 1 << 45).mode(), BinningMode::MulHigh64);
}

#[test]
fn const_zero_spans_the_whole_range() {
    let binning = FastBinning::new(1_000_000, 999_999);
    assert_eq!(binning.mode(), BinningMode::ConstZero);
    for x in [0, 1, 999_999] {
        assert_eq!(binning.divide(x), 0);
    }
}

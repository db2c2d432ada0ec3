use std::sync::Arc;
use tagstream::{BlockPolicy, Correlation, EngineConfig, InjectionSource, StreamEngine, Tag};

fn pipeline() -> (StreamEngine, InjectionSource) {
    let source = InjectionSource::new(BlockPolicy::default());
    let engine =
        StreamEngine::start(EngineConfig::default(), Arc::new(source.clone())).expect("engine");
    (engine, source)
}

fn events(channel: i32, times: &[i64]) -> Vec<Tag> {
    times.iter().map(|t| Tag::event(*t, channel)).collect()
}

fn merged(mut tags: Vec<Tag>) -> Vec<Tag> {
    tags.sort_by_key(|t| t.time);
    tags
}

/// Bin index of a difference in a histogram of `n_bins` bins of `width`.
fn bin_of(dt: i64, width: i64, n_bins: i64) -> usize {
    let half = width * n_bins / 2;
    (((dt + half) / width).min(n_bins - 1)) as usize
}

#[test]
fn autocorrelation_is_reflected_about_zero() {
    let (engine, source) = pipeline();
    let corr = Correlation::new(&engine, 1, None, 50, 10).unwrap();
    source.inject(&events(1, &[0, 100, 250])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    let data = corr.data();
    for dt in [100, 150, 250] {
        assert_eq!(data[bin_of(dt, 50, 10)], 1, "missing +{dt}");
        assert_eq!(data[bin_of(-dt, 50, 10)], 1, "missing -{dt}");
    }
    assert_eq!(data.iter().sum::<i32>(), 6);
}

#[test]
fn cross_correlation_signs_differences() {
    let (engine, source) = pipeline();
    let corr = Correlation::new(&engine, 1, Some(2), 10, 10).unwrap();
    let mut tags = events(2, &[100]);
    tags.extend(events(1, &[130])); // ch1 after ch2 -> positive dt
    tags.extend(events(2, &[165])); // ch2 after ch1 -> negative dt
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    let data = corr.data();
    assert_eq!(data[bin_of(30, 10, 10)], 1);
    assert_eq!(data[bin_of(-35, 10, 10)], 1);
    assert_eq!(data.iter().sum::<i32>(), 2);
}

#[test]
fn normalization_scales_with_rates() {
    let (engine, source) = pipeline();
    let corr = Correlation::new(&engine, 1, Some(2), 10, 4).unwrap();
    let mut tags = events(2, &[100]);
    tags.extend(events(1, &[105]));
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    let normalized = corr.data_normalized();
    let expected = 1_000f64 / (10f64 * 1.0 * 1.0);
    let bin = bin_of(5, 10, 4);
    assert!((normalized[bin] - expected).abs() < 1e-9);
}

#[test]
fn index_is_symmetric_about_zero() {
    let (engine, _source) = pipeline();
    let corr = Correlation::new(&engine, 1, None, 50, 10).unwrap();
    let index = corr.index();
    assert_eq!(index.len(), 10);
    assert_eq!(index[0], -225);
    assert_eq!(index[9], 225);
    for (lo, hi) in index.iter().zip(index.iter().rev()) {
        assert_eq!(*lo, -*hi);
    }
}

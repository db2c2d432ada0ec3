use std::sync::Arc;
use tagstream::{
    BlockPolicy, EngineConfig, Histogram, InjectionSource, StreamEngine, Tag, TimeDifferences,
};

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

#[test]
fn rollover_cycles_through_histograms() {
    let (engine, source) = pipeline();
    let td = TimeDifferences::new(&engine, 1, Some(2), Some(3), None, 5, 10, 3).unwrap();
    let mut tags = Vec::new();
    tags.extend(events(2, &[0]));
    tags.extend(events(1, &[10]));
    tags.extend(events(3, &[50]));
    tags.extend(events(2, &[100]));
    tags.extend(events(1, &[115]));
    tags.extend(events(3, &[150]));
    tags.extend(events(2, &[200]));
    tags.extend(events(1, &[225]));
    tags.extend(events(3, &[250]));
    tags.extend(events(2, &[300]));
    tags.extend(events(1, &[310]));
    source.inject(&merged(tags)).unwrap();
    source.advance(400).unwrap();
    assert!(engine.sync(2_000));

    let data = td.data();
    // dt = 10 -> bin 2 of histogram 0, twice (before and after the rollover)
    assert_eq!(data[0][2], 2);
    // dt = 15 -> bin 3 of histogram 1
    assert_eq!(data[1][3], 1);
    // dt = 25 -> bin 5 of histogram 2
    assert_eq!(data[2][5], 1);
    assert_eq!(data.iter().flatten().sum::<i32>(), 4);
    assert_eq!(td.counts(), 1);
    assert_eq!(td.histogram_index(), 0);
}

#[test]
fn sync_channel_gates_accumulation() {
    let (engine, source) = pipeline();
    let td = TimeDifferences::new(&engine, 1, Some(2), Some(3), Some(4), 5, 10, 2).unwrap();
    // Clicks before the first sync+next pair are discarded.
    assert_eq!(td.histogram_index(), -2);
    let mut tags = Vec::new();
    tags.extend(events(2, &[0]));
    tags.extend(events(1, &[10]));
    tags.extend(events(4, &[20])); // sync
    tags.extend(events(3, &[30])); // next -> histogram 0
    tags.extend(events(2, &[100]));
    tags.extend(events(1, &[112]));
    source.inject(&merged(tags)).unwrap();
    source.advance(200).unwrap();
    assert!(engine.sync(2_000));

    let data = td.data();
    assert_eq!(data[0][2], 1); // dt = 12
    assert_eq!(data.iter().flatten().sum::<i32>(), 1);
    assert_eq!(td.histogram_index(), 0);
}

#[test]
fn max_counts_stops_the_measurement() {
    let (engine, source) = pipeline();
    let td = TimeDifferences::new(&engine, 1, Some(2), Some(3), None, 5, 10, 1).unwrap();
    td.set_max_counts(2);
    let mut tags = Vec::new();
    tags.extend(events(2, &[0]));
    tags.extend(events(1, &[10]));
    tags.extend(events(3, &[50, 60])); // two rollovers with n_histograms = 1
    tags.extend(events(2, &[100]));
    tags.extend(events(1, &[110]));
    source.inject(&merged(tags)).unwrap();
    source.advance(200).unwrap();
    assert!(engine.sync(2_000));

    assert!(td.ready());
    assert_eq!(td.counts(), 2);
    assert!(!td.is_running());
    // The click after the cap never landed.
    assert_eq!(td.data()[0][2], 1);
}

#[test]
fn histogram_defaults_to_autocorrelation() {
    let (engine, source) = pipeline();
    let hist = Histogram::new(&engine, 1, None, 10, 10).unwrap();
    source.inject(&events(1, &[0, 30, 45])).unwrap();
    source.advance(200).unwrap();
    assert!(engine.sync(2_000));

    let data = hist.data();
    assert_eq!(data[3], 1); // 30 - 0
    assert_eq!(data[4], 1); // 45 - 0
    assert_eq!(data[1], 1); // 45 - 30
    assert_eq!(data.iter().sum::<i32>(), 3);
    assert_eq!(hist.index(), (0..10).map(|i| i * 10).collect::<Vec<_>>());
}

#[test]
fn start_channel_histogram() {
    let (engine, source) = pipeline();
    let hist = Histogram::new(&engine, 1, Some(2), 10, 10).unwrap();
    let mut tags = events(2, &[0]);
    tags.extend(events(1, &[15, 95, 120]));
    source.inject(&merged(tags)).unwrap();
    source.advance(200).unwrap();
    assert!(engine.sync(2_000));

    let data = hist.data();
    assert_eq!(data[1], 1); // dt = 15
    assert_eq!(data[9], 1); // dt = 95
    assert_eq!(data.iter().sum::<i32>(), 2); // dt = 120 is out of range
}

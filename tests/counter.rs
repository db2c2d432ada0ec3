use std::sync::Arc;
use tagstream::{BlockPolicy, Counter, EngineConfig, InjectionSource, StreamEngine, Tag, TagKind};

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
fn counts_per_bin_and_channel() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1, 2], 1_000_000, 3).unwrap();
    let mut tags = events(1, &[500_000, 1_500_000, 2_500_000, 3_500_000]);
    tags.extend(events(2, &[2_000_000]));
    source.inject(&merged(tags)).unwrap();
    source.advance(4_000_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(counter.data(), vec![vec![1, 1, 1], vec![0, 1, 0]]);
    assert_eq!(counter.data_total_counts(), vec![4, 1]);
    assert_eq!(counter.index(), vec![0, 1_000_000, 2_000_000]);
}

#[test]
fn newest_first_ordering_reverses_rows() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 3).unwrap();
    source
        .inject(&events(1, &[100, 1_100, 1_200]))
        .unwrap();
    source.advance(3_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(counter.data(), vec![vec![1, 2, 0]]);
    assert_eq!(counter.data_ordered(false), vec![vec![0, 2, 1]]);
}

#[test]
fn overflow_regions_invalidate_bins() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000_000, 4).unwrap();
    let mut tags = events(1, &[200_000, 2_200_000]);
    tags.push(Tag::marker(TagKind::OverflowBegin, 1_200_000));
    tags.push(Tag::missed(1_300_000, 1, 7));
    tags.push(Tag::marker(TagKind::OverflowEnd, 1_400_000));
    source.inject(&merged(tags)).unwrap();
    source.advance(3_000_000).unwrap();
    assert!(engine.sync(2_000));

    let counts = counter.data();
    assert_eq!(counts, vec![vec![0, 1, 0, 1]]);
    let normalized = counter.data_normalized();
    assert_eq!(normalized[0][0], 0.0);
    assert_eq!(normalized[0][1], 1e6);
    assert!(normalized[0][2].is_nan());
    assert_eq!(normalized[0][3], 1e6);
    // Missed events still count toward the totals.
    assert_eq!(counter.data_total_counts(), vec![9]);
}

#[test]
fn clear_resets_bins_but_keeps_running() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 2).unwrap();
    source.inject(&events(1, &[100, 1_500])).unwrap();
    source.advance(2_000).unwrap();
    assert!(engine.sync(2_000));
    assert_eq!(counter.data(), vec![vec![1, 1]]);

    counter.clear();
    assert!(counter.is_running());
    assert_eq!(counter.data(), vec![vec![0, 0]]);
    assert_eq!(counter.capture_duration(), 0);

    source.inject(&events(1, &[2_500])).unwrap();
    source.advance(4_000).unwrap();
    assert!(engine.sync(2_000));
    assert_eq!(counter.data(), vec![vec![1, 0]]);
}

#[test]
fn rejects_invalid_parameters() {
    let (engine, _source) = pipeline();
    assert!(Counter::new(&engine, vec![1], 0, 3).is_err());
    assert!(Counter::new(&engine, vec![1], 1_000, 0).is_err());
    assert!(Counter::new(&engine, vec![1, 1], 1_000, 3).is_err());
    assert!(Counter::new(&engine, vec![], 1_000, 3).is_err());
}

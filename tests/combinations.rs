use std::sync::Arc;
use tagstream::{
    BlockPolicy, Combinations, EngineConfig, InjectionSource, StreamEngine, Tag, TimeTagStream,
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
fn emits_combination_and_sum_channels_after_the_guard() {
    let (engine, source) = pipeline();
    let combinations = Combinations::new(&engine, vec![1, 2, 3], 100).unwrap();
    let pair_channel = combinations.channel(&[1, 2]).unwrap();
    let sum2 = combinations.sum_channel(2).unwrap();
    let sum1 = combinations.sum_channel(1).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![pair_channel, sum2, sum1]).unwrap();

    let mut tags = events(1, &[1_000]);
    tags.extend(events(2, &[1_050]));
    tags.extend(events(3, &[5_000]));
    source.inject(&merged(tags)).unwrap();
    source.advance(10_000).unwrap();
    assert!(engine.sync(2_000));

    let buffer = stream.take();
    // {1,2} confirmed at 1150, the lone event on 3 at 5100.
    assert_eq!(buffer.timestamps, vec![1_150, 1_150, 5_100]);
    let mut first_two = buffer.channels[..2].to_vec();
    first_two.sort_unstable();
    let mut expected = vec![pair_channel, sum2];
    expected.sort_unstable();
    assert_eq!(first_two, expected);
    assert_eq!(buffer.channels[2], sum1);
}

#[test]
fn clusters_wider_than_the_window_are_discarded() {
    let (engine, source) = pipeline();
    let combinations = Combinations::new(&engine, vec![1, 2, 3], 100).unwrap();
    let sum3 = combinations.sum_channel(3).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![sum3]).unwrap();

    // Chained gaps below the window but a total span above it.
    let mut tags = events(1, &[1_000]);
    tags.extend(events(2, &[1_090]));
    tags.extend(events(3, &[1_180]));
    source.inject(&merged(tags)).unwrap();
    source.advance(10_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(stream.take().timestamps, Vec::<i64>::new());
}

#[test]
fn duplicate_events_on_one_channel_count_once() {
    let (engine, source) = pipeline();
    let combinations = Combinations::new(&engine, vec![1, 2], 100).unwrap();
    let sum2 = combinations.sum_channel(2).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![sum2]).unwrap();

    let mut tags = events(1, &[1_000, 1_020]);
    tags.extend(events(2, &[1_050]));
    source.inject(&merged(tags)).unwrap();
    source.advance(10_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(stream.take().timestamps, vec![1_150]);
}

#[test]
fn reverse_lookup_returns_the_member_channels() {
    let (engine, _source) = pipeline();
    let combinations = Combinations::new(&engine, vec![4, 5, 6], 100).unwrap();
    let ch = combinations.channel(&[4, 6]).unwrap();
    assert_eq!(combinations.combination(ch), Some(vec![4, 6]));
    assert_eq!(combinations.combination(9999), None);
    assert!(combinations.sum_channel(4).is_err());
    assert!(combinations.channel(&[7]).is_err());
}

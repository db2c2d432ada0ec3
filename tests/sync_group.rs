use std::sync::Arc;
use tagstream::{
    BlockPolicy, Counter, EngineConfig, InjectionSource, StreamEngine, SynchronizedMeasurements,
    Tag,
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

#[test]
fn group_operations_land_on_one_block_boundary() {
    let (engine, source) = pipeline();
    let first = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let second = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let group = SynchronizedMeasurements::new(&engine);
    group.register(&first);
    group.register(&second);

    group.stop();
    assert!(engine.sync(2_000));
    assert!(!first.is_running());
    assert!(!second.is_running());
    assert!(!group.is_running());

    // Tags delivered while stopped are seen by neither member.
    source.inject(&events(1, &[100])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    group.start();
    assert!(engine.sync(2_000));
    assert!(group.is_running());
    source.inject(&events(1, &[1_100])).unwrap();
    source.advance(2_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(first.data(), second.data());
    assert_eq!(first.data()[0].iter().sum::<i32>(), 1);
}

#[test]
fn start_for_finishes_every_member() {
    let (engine, source) = pipeline();
    let first = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let second = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let group = SynchronizedMeasurements::new(&engine);
    group.register(&first);
    group.register(&second);

    group.start_for(1_000_000, true);
    source.advance(2_000_000).unwrap();
    assert!(engine.sync(2_000));

    assert!(group.wait_until_finished(2_000));
    assert_eq!(first.capture_duration(), 1_000_000);
    assert_eq!(second.capture_duration(), 1_000_000);
}

#[test]
fn unregistered_members_are_left_alone() {
    let (engine, _source) = pipeline();
    let member = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let outsider = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let group = SynchronizedMeasurements::new(&engine);
    group.register(&member);
    group.register(&outsider);
    group.unregister(&outsider);

    group.stop();
    assert!(engine.sync(2_000));
    assert!(!member.is_running());
    assert!(outsider.is_running());
}

use std::sync::Arc;
use tagstream::{
    BlockPolicy, EngineConfig, GateInitial, GatedChannel, InjectionSource, StreamEngine, Tag,
    TimeTagStream,
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
fn passes_input_only_while_open() {
    let (engine, source) = pipeline();
    let gated = GatedChannel::new(&engine, 1, 2, 3, GateInitial::Closed).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![gated.channel()]).unwrap();

    let mut tags = events(1, &[50, 150, 250]);
    tags.extend(events(2, &[100])); // open
    tags.extend(events(3, &[200])); // close
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(stream.take().timestamps, vec![150]);
}

#[test]
fn open_initial_state_passes_until_stopped() {
    let (engine, source) = pipeline();
    let gated = GatedChannel::new(&engine, 1, 2, 3, GateInitial::Open).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![gated.channel()]).unwrap();

    let mut tags = events(1, &[50, 150]);
    tags.extend(events(3, &[100])); // close
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(stream.take().timestamps, vec![50]);
}

#[test]
fn repeated_edges_have_no_extra_effect() {
    let (engine, source) = pipeline();
    let gated = GatedChannel::new(&engine, 1, 2, 3, GateInitial::Closed).unwrap();
    let stream = TimeTagStream::new(&engine, 100, vec![gated.channel()]).unwrap();

    let mut tags = events(2, &[100, 110]); // double open
    tags.extend(events(1, &[120]));
    tags.extend(events(3, &[130, 140])); // double close
    tags.extend(events(1, &[150]));
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(stream.take().timestamps, vec![120]);
}

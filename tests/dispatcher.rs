use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tagstream::{
    attach_custom, BlockPolicy, BlockWindow, Counter, EngineConfig, InjectionSource, Measurement,
    NextError, StreamEngine, Tag, TagBatch, TimeTagStream, VIRTUAL_CHANNEL_BASE,
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

struct Recorder {
    windows: Arc<Mutex<Vec<(i64, i64)>>>,
    seen: Arc<Mutex<Vec<Tag>>>,
}

impl Measurement for Recorder {
    fn next(&mut self, batch: &mut TagBatch<'_>, window: BlockWindow) -> Result<bool, NextError> {
        if window.end > window.begin {
            self.windows.lock().unwrap().push((window.begin, window.end));
        }
        for i in 0..batch.len() {
            let tag = batch.get(i);
            if tag.is_event() {
                self.seen.lock().unwrap().push(tag);
            }
        }
        Ok(false)
    }
}

#[test]
fn deliveries_cover_abutting_intervals() {
    let (engine, source) = pipeline();
    let windows = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _recorder = attach_custom(
        &engine,
        Recorder {
            windows: windows.clone(),
            seen: seen.clone(),
        },
        BTreeSet::from([1]),
    );

    source.inject(&events(1, &[100])).unwrap();
    source.advance(1_000).unwrap();
    source.inject(&events(1, &[1_500])).unwrap();
    source.advance(2_000).unwrap();
    source.advance(2_500).unwrap();
    assert!(engine.sync(2_000));

    let windows = windows.lock().unwrap().clone();
    assert!(windows.len() >= 3);
    for pair in windows.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
}

#[test]
fn fences_wait_for_processing() {
    let (engine, source) = pipeline();
    let fence = engine.fence();
    assert!(engine.wait_for_fence(fence, 2_000));
    // Polling an already passed fence succeeds without waiting.
    assert!(engine.wait_for_fence(fence, 0));
    // Future fences time out.
    assert!(!engine.wait_for_fence(fence + 10, 50));
    drop(source);
}

#[test]
fn zero_tag_blocks_advance_capture_and_stop() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    counter.start_for(2_000_000, true);
    source.advance(500_000).unwrap();
    source.advance(5_000_000).unwrap();
    assert!(engine.sync(2_000));

    assert!(counter.wait_until_finished(2_000));
    assert!(!counter.is_running());
    assert_eq!(counter.capture_duration(), 2_000_000);
}

#[test]
fn start_for_bounds_the_capture_duration() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000_000, 4).unwrap();
    counter.start_for(1_500_000, true);
    for i in 1i64..=4 {
        source.inject(&events(1, &[i * 1_000_000 - 500_000])).unwrap();
        source.advance(i * 1_000_000).unwrap();
    }
    assert!(engine.sync(2_000));

    assert!(counter.wait_until_finished(2_000));
    assert!(counter.capture_duration() >= 1_500_000);
    assert!(counter.capture_duration() < 1_500_000 + 1_000_000);
}

#[test]
fn wait_until_finished_rejects_unbounded_measurements() {
    let (engine, _source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    assert!(counter.is_running());
    assert!(!counter.wait_until_finished(10));
}

#[test]
fn virtual_tags_reach_only_later_consumers() {
    let (engine, source) = pipeline();
    // Attached before the producer exists: never sees its output.
    let early = TimeTagStream::new(&engine, 100, vec![VIRTUAL_CHANNEL_BASE]).unwrap();
    let combiner = tagstream::Combiner::new(&engine, vec![1]).unwrap();
    assert_eq!(combiner.channel(), VIRTUAL_CHANNEL_BASE);
    let late = TimeTagStream::new(&engine, 100, vec![combiner.channel()]).unwrap();

    source.inject(&events(1, &[100, 200])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(early.take().len(), 0);
    assert_eq!(late.take().timestamps, vec![100, 200]);
}

#[test]
fn abort_detaches_promptly_and_spares_the_rest() {
    let (engine, source) = pipeline();
    let doomed = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    let survivor = Counter::new(&engine, vec![1], 1_000, 4).unwrap();

    doomed.abort();
    source.inject(&events(1, &[100])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert!(!doomed.is_running());
    assert!(survivor.is_running());
    assert_eq!(survivor.data(), vec![vec![0, 0, 0, 1]]);
    // Aborting discards accumulated data.
    assert_eq!(doomed.data(), vec![vec![0, 0, 0, 0]]);
}

#[test]
fn telemetry_tracks_attached_measurements() {
    let (engine, source) = pipeline();
    let _counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    source.inject(&events(1, &[100, 200])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    let telemetry = engine.telemetry();
    let entry = telemetry
        .iter()
        .find(|t| t.label == "Counter")
        .expect("counter telemetry");
    assert_eq!(entry.tags_processed, 2);
    assert!(entry.blocks_delivered >= 1);
}

#[test]
fn configuration_reports_measurement_states() {
    let (engine, source) = pipeline();
    let _counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    assert!(engine.sync(2_000));
    let report: serde_json::Value = serde_json::from_str(&engine.configuration()).unwrap();
    assert_eq!(report["measurements"][0]["label"], "Counter");
    assert_eq!(report["measurements"][0]["running"], true);
    drop(source);
}

#[test]
fn handles_detach_cleanly_on_drop() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    assert!(!source.transported_channels().is_empty());
    drop(counter);
    assert!(source.transported_channels().is_empty());

    // The stream keeps flowing for everyone else.
    let other = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    source.inject(&events(1, &[100])).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));
    assert_eq!(other.data()[0][3], 1);
}

#[test]
fn end_of_stream_stops_measurements() {
    let (engine, source) = pipeline();
    let counter = Counter::new(&engine, vec![1], 1_000, 4).unwrap();
    source.inject(&events(1, &[100])).unwrap();
    source.close();
    assert!(engine.wait_drained(2_000));
    assert!(!counter.is_running());
}

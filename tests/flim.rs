use std::sync::{Arc, Mutex};
use tagstream::{
    BlockPolicy, EngineConfig, Flim, FlimConfig, InjectionSource, StreamEngine, Tag,
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

fn base_config() -> FlimConfig {
    FlimConfig {
        start_channel: 1,
        click_channel: 2,
        pixel_begin_channel: 3,
        n_pixels: 2,
        n_bins: 4,
        binwidth: 10,
        pixel_end_channel: None,
        frame_begin_channel: None,
        finish_after_frames: 0,
    }
}

#[test]
fn bins_clicks_per_pixel_relative_to_the_last_start() {
    let (engine, source) = pipeline();
    let flim = Flim::new(&engine, base_config()).unwrap();

    let mut tags = events(1, &[100, 200]); // laser starts
    tags.extend(events(3, &[100, 200, 300])); // pixel begins
    tags.extend(events(2, &[105, 115, 212])); // clicks
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(flim.frames_acquired(), 1);
    let frame = flim.ready_frame(None).expect("one frame is complete");
    // Pixel 0: dt 5 -> bin 0, dt 15 -> bin 1. Pixel 1: dt 12 -> bin 1.
    assert_eq!(frame.histograms, vec![1, 1, 0, 0, 0, 1, 0, 0]);
    assert_eq!(frame.pixel_begins, vec![100, 200]);
    assert_eq!(frame.pixel_ends, vec![200, 300]);
    assert_eq!(flim.index(), vec![0, 10, 20, 30]);
}

#[test]
fn frame_begin_publishes_partial_frames() {
    let (engine, source) = pipeline();
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let mut config = base_config();
    config.frame_begin_channel = Some(4);
    let flim = Flim::with_callback(
        &engine,
        config,
        Some(Box::new(move |frame| {
            sink.lock()
                .unwrap()
                .push((frame.frame_number, frame.pixel_position));
        })),
    )
    .unwrap();

    let mut tags = events(4, &[50]); // frame begin
    tags.extend(events(1, &[100]));
    tags.extend(events(3, &[100])); // single pixel only
    tags.extend(events(2, &[108]));
    tags.extend(events(4, &[500])); // next frame publishes the partial one
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(flim.frames_acquired(), 2);
    let published = recorded.lock().unwrap().clone();
    assert_eq!(published.len(), 2);
    // Second publication carries the one acquired pixel.
    assert_eq!(published[1].1, 1);
}

#[test]
fn finishes_after_the_configured_frame_budget() {
    let (engine, source) = pipeline();
    let mut config = base_config();
    config.finish_after_frames = 1;
    let flim = Flim::new(&engine, config).unwrap();

    let mut tags = events(1, &[100, 200]);
    tags.extend(events(3, &[100, 200, 300, 400]));
    tags.extend(events(2, &[105]));
    source.inject(&merged(tags)).unwrap();
    source.advance(1_000).unwrap();
    assert!(engine.sync(2_000));

    assert_eq!(flim.frames_acquired(), 1);
    assert!(!flim.is_acquiring());
    assert!(!flim.is_running());
    assert_eq!(flim.summed_frames().iter().sum::<u64>(), 1);
}

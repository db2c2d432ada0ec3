use std::sync::Arc;
use tagstream::{
    BlockPolicy, EngineConfig, FileReader, FileWriter, InjectionSource, ReplaySource,
    StreamEngine, Tag, TimeTagStream,
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
fn written_streams_read_back_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.ttd");
    let written = {
        let (engine, source) = pipeline();
        let writer = FileWriter::new(&engine, &path, vec![1, 2]).unwrap();
        let mut tags = events(1, &[100, 250, 900]);
        tags.extend(events(2, &[400]));
        let tags = merged(tags);
        source.inject(&tags).unwrap();
        source.advance(1_000).unwrap();
        source.close();
        assert!(engine.wait_drained(2_000));
        assert_eq!(writer.total_events(), 4);
        tags
    };

    let mut reader = FileReader::open(&path).unwrap();
    assert_eq!(reader.channel_list(), vec![1, 2]);
    assert!(reader.has_data().unwrap());
    let buffer = reader.read(16).unwrap();
    assert_eq!(buffer.to_tags(), written);
    assert!(!reader.has_data().unwrap());
}

#[test]
fn block_boundaries_survive_the_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocks.ttd");
    {
        // Generous latency bounds so only the explicit cuts decide the
        // block boundaries asserted below.
        let policy = BlockPolicy {
            max_latency: std::time::Duration::from_secs(3_600),
            idle_flush: std::time::Duration::from_secs(3_600),
            ..BlockPolicy::default()
        };
        let source = InjectionSource::new(policy);
        let engine = StreamEngine::start(EngineConfig::default(), Arc::new(source.clone()))
            .expect("engine");
        let _writer = FileWriter::new(&engine, &path, vec![1]).unwrap();
        source.inject(&events(1, &[100])).unwrap();
        source.advance(500).unwrap();
        source.inject(&events(1, &[700])).unwrap();
        source.advance(1_000).unwrap();
        source.close();
        assert!(engine.wait_drained(2_000));
    }

    let mut reader = FileReader::open(&path).unwrap();
    let first = reader.read_block().unwrap().expect("first block");
    let second = reader.read_block().unwrap().expect("second block");
    assert_eq!((first.begin, first.end), (0, 500));
    assert_eq!((second.begin, second.end), (500, 1_000));
    assert_eq!(first.end, second.begin);
}

#[test]
fn splitting_produces_a_chain_the_reader_follows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("split.ttd");
    {
        let (engine, source) = pipeline();
        let writer = FileWriter::new(&engine, &path, vec![1]).unwrap();
        writer.set_max_file_size(1);
        for i in 0i64..4 {
            source
                .inject(&events(1, &[i * 1_000 + 100]))
                .unwrap();
            source.advance((i + 1) * 1_000).unwrap();
            assert!(engine.sync(2_000));
        }
        source.close();
        assert!(engine.wait_drained(2_000));
        assert!(writer.total_size() > 0);
    }

    assert!(dir.path().join("split.ttd.1").exists());
    let mut reader = FileReader::open(&path).unwrap();
    let buffer = reader.read(64).unwrap();
    assert_eq!(buffer.timestamps, vec![100, 1_100, 2_100, 3_100]);
}

#[test]
fn markers_are_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marked.ttd");
    {
        let (engine, source) = pipeline();
        let writer = FileWriter::new(&engine, &path, vec![1]).unwrap();
        writer.set_marker("scan-line-17");
        source.inject(&events(1, &[100])).unwrap();
        source.advance(1_000).unwrap();
        source.close();
        assert!(engine.wait_drained(2_000));
    }

    let mut reader = FileReader::open(&path).unwrap();
    let _ = reader.read(16).unwrap();
    assert_eq!(reader.last_marker(), Some("scan-line-17".into()));
}

#[test]
fn recorded_streams_replay_deterministically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.ttd");
    let tags = {
        let (engine, source) = pipeline();
        let _writer = FileWriter::new(&engine, &path, vec![1]).unwrap();
        let tags = events(1, &[100, 300, 800]);
        source.inject(&tags).unwrap();
        source.advance(1_000).unwrap();
        source.close();
        assert!(engine.wait_drained(2_000));
        tags
    };

    let replay = Arc::new(ReplaySource::open(&path).unwrap());
    let engine = StreamEngine::start(EngineConfig::default(), replay.clone()).expect("engine");
    let stream = TimeTagStream::new(&engine, 100, vec![1]).unwrap();
    replay.start();
    assert!(engine.wait_drained(2_000));
    assert_eq!(stream.take().to_tags(), tags);
}

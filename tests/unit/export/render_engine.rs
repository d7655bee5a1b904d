use super::*;
use crate::encode::sink::InMemorySink;
use crate::foundation::core::Fps;
use crate::foundation::error::FramegraphError;
use crate::graph::dsl::CompositionBuilder;
use crate::ops::OperationRegistry;
use crate::texture::TextureDesc;
use serde_json::Value;
use std::sync::mpsc;
use std::time::Duration;

fn graph(frames: u64) -> Arc<Graph> {
    let comp = CompositionBuilder::new(Fps::new(10, 1).unwrap(), frames)
        .source("src", 4, 4)
        .op("inv", "invert", Value::Null)
        .connect("src", "inv", 0)
        .output("inv")
        .build()
        .unwrap();
    Arc::new(Graph::build(&comp, &OperationRegistry::with_builtins()).unwrap())
}

fn still() -> StillFrames {
    StillFrames::new().with(
        "src",
        Texture::solid(TextureDesc::rgba8_premul(4, 4), [10, 20, 30, 255]).unwrap(),
    )
}

fn engine_into(sink: &InMemorySink, frames: impl FrameSource + 'static) -> RenderExportEngine {
    let sink = sink.clone();
    RenderExportEngine::new(frames).with_sink_factory(move |_path: &Path, _preset: QualityPreset| {
        Ok(Box::new(sink.clone()) as Box<dyn FrameSink>)
    })
}

fn start(
    engine: &mut RenderExportEngine,
    session: &RenderSession,
) -> mpsc::Receiver<EngineOutcome> {
    let (tx, rx) = mpsc::channel();
    engine.export_async(
        session,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    rx
}

const WAIT: Duration = Duration::from_secs(30);

#[test]
fn exports_every_frame_in_order() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, still());
    let session = engine
        .create_session(graph(5), QualityPreset::High, Path::new("out.mp4"))
        .unwrap();
    assert_eq!(engine.status(&session), SessionStatus::Waiting);
    assert_eq!(engine.progress(&session), None);

    let rx = start(&mut engine, &session);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), EngineOutcome::Completed);

    assert_eq!(engine.status(&session), SessionStatus::Completed);
    assert_eq!(engine.progress(&session), Some(1.0));
    let frames = sink.frames();
    assert_eq!(
        frames.iter().map(|(i, _)| i.0).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
    assert_eq!(frames[0].1.pixel(0, 0), Some([245, 235, 225, 255]));
    assert!(sink.ended());
    assert_eq!(sink.config().unwrap().preset, QualityPreset::High);
}

#[test]
fn empty_timeline_is_rejected() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, still());
    let err = engine
        .create_session(graph(0), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap_err();
    assert!(err.message.contains("no frames"));
}

#[test]
fn backend_failure_fails_session_creation() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, still()).with_backend_factory(|| {
        Err(FramegraphError::from(
            crate::foundation::error::ResourceError::DeviceUnavailable("no adapter".to_owned()),
        ))
    });
    let err = engine
        .create_session(graph(2), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap_err();
    assert!(err.message.contains("no adapter"));
}

#[test]
fn missing_source_fails_and_aborts_sink() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, StillFrames::new());
    let session = engine
        .create_session(graph(3), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap();
    let rx = start(&mut engine, &session);
    match rx.recv_timeout(WAIT).unwrap() {
        EngineOutcome::Failed(e) => assert!(e.message.contains("missing"), "{e}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.status(&session), SessionStatus::Failed);
    assert!(sink.aborted());
    assert!(!sink.ended());
}

#[test]
fn cancel_mid_export_stops_between_frames() {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate = Mutex::new(gate_rx);
    let frames = move |idx: FrameIndex| -> FramegraphResult<FrameInputs> {
        if idx.0 == 1 {
            let _ = gate.lock().unwrap().recv();
        }
        still().frame(idx)
    };

    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, frames);
    let session = engine
        .create_session(graph(10), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap();
    let rx = start(&mut engine, &session);
    engine.cancel(&session);
    gate_tx.send(()).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), EngineOutcome::Cancelled);
    assert_eq!(engine.status(&session), SessionStatus::Cancelled);
    assert!(engine.progress(&session).unwrap() < 1.0);
    assert!(sink.aborted());
    assert_eq!(sink.frame_count(), 0);
}

#[test]
fn cancel_before_start_aborts_immediately() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, still());
    let session = engine
        .create_session(graph(3), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap();
    engine.cancel(&session);
    assert_eq!(engine.status(&session), SessionStatus::Cancelled);
    assert!(sink.aborted());

    let rx = start(&mut engine, &session);
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        EngineOutcome::Failed(_)
    ));
}

#[test]
fn a_session_runs_once() {
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, still());
    let session = engine
        .create_session(graph(2), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap();
    let first = start(&mut engine, &session);
    let second = start(&mut engine, &session);
    assert!(matches!(
        second.recv_timeout(WAIT).unwrap(),
        EngineOutcome::Failed(e) if e.message.contains("already started")
    ));
    assert_eq!(first.recv_timeout(WAIT).unwrap(), EngineOutcome::Completed);
    assert_eq!(sink.frame_count(), 2);
}

#[test]
fn a_panicking_frame_source_still_reports_failure() {
    let frames = |idx: FrameIndex| -> FramegraphResult<FrameInputs> {
        if idx.0 == 2 {
            panic!("decoder blew up");
        }
        still().frame(idx)
    };
    let sink = InMemorySink::new();
    let mut engine = engine_into(&sink, frames);
    let session = engine
        .create_session(graph(4), QualityPreset::Low, Path::new("out.mp4"))
        .unwrap();

    let rx = start(&mut engine, &session);
    match rx.recv_timeout(WAIT).unwrap() {
        EngineOutcome::Failed(e) => assert!(e.message.contains("decoder blew up"), "{e}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.status(&session), SessionStatus::Failed);
    assert!(sink.aborted());
    assert_eq!(sink.frame_count(), 2);
}

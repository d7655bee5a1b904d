use super::*;
use crate::foundation::core::Fps;
use crate::graph::dsl::CompositionBuilder;
use crate::ops::{Operation, OperationRegistry};
use crate::render::cpu::{CpuBackend, CpuBackendOpts};
use crate::texture::TextureDesc;
use serde_json::{Value, json};
use std::sync::Mutex;

/// CPU backend that records executions and can inject failures.
struct RecordingBackend {
    inner: CpuBackend,
    log: Arc<Mutex<CallLog>>,
}

#[derive(Default)]
struct CallLog {
    executed: Vec<String>,
    fail_on: Option<(String, RenderError)>,
    fail_times: u32,
    resets: u32,
    max_live: usize,
}

impl RecordingBackend {
    fn new() -> (Self, Arc<Mutex<CallLog>>) {
        let log = Arc::new(Mutex::new(CallLog::default()));
        (
            Self {
                inner: CpuBackend::new(CpuBackendOpts::default()),
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl RenderBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn prepare(&mut self, op: &Operation) -> Result<(), ResourceError> {
        self.inner.prepare(op)
    }

    fn upload(&mut self, slot: SlotId, texture: &Texture) -> Result<(), RenderError> {
        self.inner.upload(slot, texture)?;
        let mut log = self.log.lock().unwrap();
        log.max_live = log.max_live.max(self.inner.live_slots());
        Ok(())
    }

    fn execute(
        &mut self,
        op: &Operation,
        inputs: &[SlotId],
        output: SlotId,
        desc: TextureDesc,
    ) -> Result<(), RenderError> {
        {
            let mut log = self.log.lock().unwrap();
            if log.fail_times > 0
                && let Some((target, err)) = log.fail_on.clone()
                && target == op.id()
            {
                log.fail_times -= 1;
                return Err(err);
            }
            log.executed.push(op.id().to_owned());
        }
        self.inner.execute(op, inputs, output, desc)?;
        let mut log = self.log.lock().unwrap();
        log.max_live = log.max_live.max(self.inner.live_slots());
        Ok(())
    }

    fn readback(&mut self, slot: SlotId) -> Result<Texture, RenderError> {
        self.inner.readback(slot)
    }

    fn release(&mut self, slot: SlotId) {
        self.inner.release(slot)
    }

    fn reset_resources(&mut self) -> Result<(), ResourceError> {
        self.log.lock().unwrap().resets += 1;
        self.inner.reset_resources()
    }

    fn live_slots(&self) -> usize {
        self.inner.live_slots()
    }
}

fn graph(c: CompositionBuilder) -> Arc<Graph> {
    Arc::new(Graph::build(&c.build().unwrap(), &OperationRegistry::with_builtins()).unwrap())
}

fn base() -> CompositionBuilder {
    CompositionBuilder::new(Fps::new(30, 1).unwrap(), 1).source("src", 8, 8)
}

fn diamond() -> Arc<Graph> {
    graph(
        base()
            .op("shared", "fxaa", Value::Null)
            .op("left", "invert", Value::Null)
            .op("right", "brightness", json!({ "amount": 0.2 }))
            .op("join", "mix", Value::Null)
            .connect("src", "shared", 0)
            .connect("shared", "left", 0)
            .connect("shared", "right", 0)
            .connect("left", "join", 0)
            .connect("right", "join", 1)
            .output("join"),
    )
}

fn gradient() -> Texture {
    Texture::from_fn(TextureDesc::rgba8_premul(8, 8), |x, y| {
        [(x * 32) as u8, (y * 32) as u8, 128, 255]
    })
    .unwrap()
}

fn inputs() -> FrameInputs {
    FrameInputs::new().with("src", gradient())
}

#[test]
fn diamond_runs_shared_producer_once() {
    let (be, log) = RecordingBackend::new();
    let mut p = RenderPipeline::new(diamond(), Box::new(be), RenderPipelineOpts::default()).unwrap();
    p.render(&inputs()).unwrap();

    let executed = log.lock().unwrap().executed.clone();
    assert_eq!(executed, vec!["shared", "left", "right", "join"]);
    assert_eq!(p.stats().ops_executed, 4);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn identical_inputs_render_identical_frames() {
    let (be, _) = RecordingBackend::new();
    let mut p = RenderPipeline::new(diamond(), Box::new(be), RenderPipelineOpts::default()).unwrap();
    let a = p.render(&inputs()).unwrap();
    let b = p.render(&inputs()).unwrap();
    assert_eq!(a.data(), b.data());

    let mut other = RenderPipeline::new(
        diamond(),
        Box::new(CpuBackend::new(CpuBackendOpts::default())),
        RenderPipelineOpts::default(),
    )
    .unwrap();
    assert_eq!(other.render(&inputs()).unwrap().digest(), a.digest());
}

#[test]
fn textures_are_released_after_last_consumer() {
    let chain = graph(
        base()
            .op("a", "invert", Value::Null)
            .op("b", "invert", Value::Null)
            .op("c", "invert", Value::Null)
            .op("d", "invert", Value::Null)
            .connect("src", "a", 0)
            .connect("a", "b", 0)
            .connect("b", "c", 0)
            .connect("c", "d", 0)
            .output("d"),
    );
    let (be, log) = RecordingBackend::new();
    let mut p = RenderPipeline::new(chain, Box::new(be), RenderPipelineOpts::default()).unwrap();
    let out = p.render(&inputs()).unwrap();

    assert_eq!(out, gradient());
    assert_eq!(p.stats().peak_live_textures, 2);
    assert_eq!(log.lock().unwrap().max_live, 2);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn unconsumed_ops_still_run_and_are_dropped() {
    let g = graph(
        base()
            .op("dead", "invert", Value::Null)
            .op("out", "passthrough", Value::Null)
            .connect("src", "dead", 0)
            .connect("src", "out", 0)
            .output("out"),
    );
    let (be, log) = RecordingBackend::new();
    let mut p = RenderPipeline::new(g, Box::new(be), RenderPipelineOpts::default()).unwrap();
    p.render(&inputs()).unwrap();
    assert_eq!(log.lock().unwrap().executed, vec!["dead", "out"]);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn device_loss_is_retried_once_with_fresh_resources() {
    let (be, log) = RecordingBackend::new();
    {
        let mut l = log.lock().unwrap();
        l.fail_on = Some(("right".to_owned(), RenderError::DeviceLost("test".into())));
        l.fail_times = 1;
    }
    let mut p = RenderPipeline::new(diamond(), Box::new(be), RenderPipelineOpts::default()).unwrap();
    let frame = p.render(&inputs()).unwrap();

    let mut clean = RenderPipeline::new(
        diamond(),
        Box::new(CpuBackend::new(CpuBackendOpts::default())),
        RenderPipelineOpts::default(),
    )
    .unwrap();
    assert_eq!(frame, clean.render(&inputs()).unwrap());
    assert_eq!(log.lock().unwrap().resets, 1);
    assert_eq!(p.stats().retries, 1);
    assert_eq!(p.stats().frames, 1);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn second_device_failure_is_terminal() {
    let (be, log) = RecordingBackend::new();
    {
        let mut l = log.lock().unwrap();
        l.fail_on = Some(("join".to_owned(), RenderError::OutOfMemory("test".into())));
        l.fail_times = 2;
    }
    let mut p = RenderPipeline::new(diamond(), Box::new(be), RenderPipelineOpts::default()).unwrap();
    let err = p.render(&inputs()).unwrap_err();
    assert!(matches!(err, RenderError::OutOfMemory(_)));
    assert_eq!(p.stats().frames, 0);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn non_device_errors_are_not_retried() {
    let (be, log) = RecordingBackend::new();
    {
        let mut l = log.lock().unwrap();
        l.fail_on = Some(("left".to_owned(), RenderError::backend("shader trap")));
        l.fail_times = 1;
    }
    let mut p = RenderPipeline::new(diamond(), Box::new(be), RenderPipelineOpts::default()).unwrap();
    assert!(matches!(p.render(&inputs()), Err(RenderError::Backend(_))));
    assert_eq!(log.lock().unwrap().resets, 0);
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn retry_can_be_disabled() {
    let (be, log) = RecordingBackend::new();
    {
        let mut l = log.lock().unwrap();
        l.fail_on = Some(("shared".to_owned(), RenderError::DeviceLost("test".into())));
        l.fail_times = 1;
    }
    let mut p = RenderPipeline::new(
        diamond(),
        Box::new(be),
        RenderPipelineOpts {
            retry_on_device_error: false,
        },
    )
    .unwrap();
    assert!(p.render(&inputs()).is_err());
    assert_eq!(log.lock().unwrap().resets, 0);
}

#[test]
fn missing_and_mismatched_sources_are_rejected() {
    let mut p = RenderPipeline::new(
        diamond(),
        Box::new(CpuBackend::new(CpuBackendOpts::default())),
        RenderPipelineOpts::default(),
    )
    .unwrap();
    assert_eq!(
        p.render(&FrameInputs::new()).unwrap_err(),
        RenderError::MissingSource("src".to_owned())
    );

    let wrong = FrameInputs::new().with(
        "src",
        Texture::solid(TextureDesc::rgba8_premul(4, 4), [0, 0, 0, 255]).unwrap(),
    );
    assert!(matches!(
        p.render(&wrong),
        Err(RenderError::SourceMismatch { .. })
    ));
    assert_eq!(p.live_textures(), 0);
}

#[test]
fn unknown_program_fails_pipeline_construction() {
    let mut reg = OperationRegistry::with_builtins();
    let mut kind = (*reg.get("invert").unwrap()).clone();
    kind.name = "warp".into();
    kind.program.id = "warp".into();
    reg.register(kind).unwrap();
    let g = Graph::build(
        &base()
            .op("w", "warp", Value::Null)
            .connect("src", "w", 0)
            .output("w")
            .build()
            .unwrap(),
        &reg,
    )
    .unwrap();

    let err = RenderPipeline::new(
        Arc::new(g),
        Box::new(CpuBackend::new(CpuBackendOpts::default())),
        RenderPipelineOpts::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ResourceError::ShaderNotFound { .. }));
}

#[test]
fn one_graph_feeds_two_pipelines_concurrently() {
    let g = diamond();
    let expected = RenderPipeline::new(
        Arc::clone(&g),
        Box::new(CpuBackend::new(CpuBackendOpts::default())),
        RenderPipelineOpts::default(),
    )
    .unwrap()
    .render(&inputs())
    .unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let g = Arc::clone(&g);
            std::thread::spawn(move || {
                let mut p = RenderPipeline::new(
                    g,
                    Box::new(CpuBackend::new(CpuBackendOpts::default())),
                    RenderPipelineOpts::default(),
                )
                .unwrap();
                p.render(&inputs()).unwrap()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), expected);
    }
}

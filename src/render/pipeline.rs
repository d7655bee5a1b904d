use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::foundation::error::{RenderError, ResourceError};
use crate::graph::build::{Graph, NodeId};
use crate::render::backend::{RenderBackend, SlotId};
use crate::texture::Texture;

/// Render pipeline options.
#[derive(Clone, Debug)]
pub struct RenderPipelineOpts {
    /// Reset backend resources and retry a frame once after a device-level failure.
    pub retry_on_device_error: bool,
}

impl Default for RenderPipelineOpts {
    fn default() -> Self {
        Self {
            retry_on_device_error: true,
        }
    }
}

/// Source textures for one frame, keyed by source id.
#[derive(Clone, Debug, Default)]
pub struct FrameInputs {
    textures: HashMap<String, Arc<Texture>>,
}

impl FrameInputs {
    /// No inputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the texture for `source`.
    pub fn with(mut self, source: impl Into<String>, texture: impl Into<Arc<Texture>>) -> Self {
        self.insert(source, texture);
        self
    }

    /// Add or replace the texture for `source`.
    pub fn insert(&mut self, source: impl Into<String>, texture: impl Into<Arc<Texture>>) {
        self.textures.insert(source.into(), texture.into());
    }

    /// Texture for `source`, if supplied.
    pub fn get(&self, source: &str) -> Option<&Texture> {
        self.textures.get(source).map(Arc::as_ref)
    }
}

/// Counters accumulated across frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Frames that produced an output.
    pub frames: u64,
    /// Operation executions, including those in attempts that were later retried.
    pub ops_executed: u64,
    /// Highest number of simultaneously resident textures seen in any frame.
    pub peak_live_textures: usize,
    /// Frames that needed a resource reset and second attempt.
    pub retries: u64,
}

/// Executes a [`Graph`] once per frame on a [`RenderBackend`].
///
/// Each frame runs every operation exactly once in the graph's fixed order. A texture is released
/// as soon as its last consumer has run, so resident memory tracks the live set rather than the
/// graph size. Any failure releases everything the frame had allocated.
pub struct RenderPipeline {
    graph: Arc<Graph>,
    backend: Box<dyn RenderBackend>,
    opts: RenderPipelineOpts,
    stats: RenderStats,

    // Per-frame scratch, indexed by node id.
    remaining: Vec<u32>,
    resident: Vec<bool>,
}

impl RenderPipeline {
    /// Prepare every operation's pipeline on `backend`.
    pub fn new(
        graph: Arc<Graph>,
        backend: Box<dyn RenderBackend>,
        opts: RenderPipelineOpts,
    ) -> Result<Self, ResourceError> {
        let n = graph.node_count();
        let mut p = Self {
            graph,
            backend,
            opts,
            stats: RenderStats::default(),
            remaining: vec![0; n],
            resident: vec![false; n],
        };
        p.prepare_all()?;
        tracing::debug!(
            backend = p.backend.name(),
            ops = p.graph.ops().len(),
            "render pipelines prepared"
        );
        Ok(p)
    }

    /// The graph this pipeline renders.
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Accumulated counters.
    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Backend name, for logs.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of textures the backend currently holds. Zero between frames.
    pub fn live_textures(&self) -> usize {
        self.backend.live_slots()
    }

    fn prepare_all(&mut self) -> Result<(), ResourceError> {
        for node in self.graph.ops() {
            self.backend.prepare(&node.op)?;
        }
        Ok(())
    }

    /// Render one frame and read back the output texture.
    ///
    /// A device-level failure is retried once after resetting backend resources (when enabled);
    /// any other failure, or a second failure, is returned. No partial output is ever returned.
    #[tracing::instrument(skip(self, inputs), fields(backend = self.backend.name()))]
    pub fn render(&mut self, inputs: &FrameInputs) -> Result<Texture, RenderError> {
        self.check_inputs(inputs)?;
        match self.render_once(inputs) {
            Ok(t) => Ok(t),
            Err(e) if e.is_retryable() && self.opts.retry_on_device_error => {
                tracing::warn!(error = %e, "retrying frame with fresh resources");
                self.stats.retries = self.stats.retries.saturating_add(1);
                self.backend
                    .reset_resources()
                    .map_err(|re| RenderError::DeviceLost(re.to_string()))?;
                self.prepare_all()
                    .map_err(|re| RenderError::DeviceLost(re.to_string()))?;
                self.render_once(inputs)
            }
            Err(e) => Err(e),
        }
    }

    fn check_inputs(&self, inputs: &FrameInputs) -> Result<(), RenderError> {
        for (i, src) in self.graph.sources().iter().enumerate() {
            if self.graph.consumer_count(NodeId(i as u32)) == 0 {
                continue;
            }
            let t = inputs
                .get(&src.id)
                .ok_or_else(|| RenderError::MissingSource(src.id.clone()))?;
            if t.desc() != src.desc {
                return Err(RenderError::SourceMismatch {
                    source_id: src.id.clone(),
                    expected: src.desc.to_string(),
                    got: t.desc().to_string(),
                });
            }
        }
        Ok(())
    }

    fn render_once(&mut self, inputs: &FrameInputs) -> Result<Texture, RenderError> {
        let result = self.execute_frame(inputs);
        if result.is_err() {
            self.release_all();
        }
        result
    }

    fn execute_frame(&mut self, inputs: &FrameInputs) -> Result<Texture, RenderError> {
        let graph = Arc::clone(&self.graph);
        for i in 0..graph.node_count() {
            self.remaining[i] = graph.consumer_count(NodeId(i as u32));
        }
        let mut live = 0usize;

        for &id in graph.order() {
            let Some(node) = graph.op(id) else {
                continue;
            };

            for &input in &node.inputs {
                if graph.is_source(input) && !self.resident[input.index()] {
                    let src = &graph.sources()[input.index()];
                    let t = inputs
                        .get(&src.id)
                        .ok_or_else(|| RenderError::MissingSource(src.id.clone()))?;
                    self.backend.upload(slot(input), t)?;
                    self.resident[input.index()] = true;
                    live += 1;
                    self.note_live(live);
                }
            }

            let in_slots: SmallVec<[SlotId; 2]> = node.inputs.iter().map(|&n| slot(n)).collect();
            self.backend
                .execute(&node.op, &in_slots, slot(id), node.output)?;
            self.resident[id.index()] = true;
            live += 1;
            self.note_live(live);
            self.stats.ops_executed = self.stats.ops_executed.saturating_add(1);

            for &input in &node.inputs {
                let r = &mut self.remaining[input.index()];
                *r = r.saturating_sub(1);
                if *r == 0 && self.resident[input.index()] {
                    self.backend.release(slot(input));
                    self.resident[input.index()] = false;
                    live -= 1;
                }
            }
            // Nothing reads it: drop right away.
            if self.remaining[id.index()] == 0 {
                self.backend.release(slot(id));
                self.resident[id.index()] = false;
                live -= 1;
            }
        }

        let out = graph.output();
        let frame = self.backend.readback(slot(out))?;
        self.backend.release(slot(out));
        self.resident[out.index()] = false;
        self.stats.frames = self.stats.frames.saturating_add(1);
        Ok(frame)
    }

    fn note_live(&mut self, live: usize) {
        self.stats.peak_live_textures = self.stats.peak_live_textures.max(live);
    }

    fn release_all(&mut self) {
        for i in 0..self.resident.len() {
            if std::mem::take(&mut self.resident[i]) {
                self.backend.release(SlotId(i as u32));
            }
        }
    }
}

fn slot(id: NodeId) -> SlotId {
    SlotId(id.0)
}

#[cfg(test)]
#[path = "../../tests/unit/render/pipeline.rs"]
mod tests;

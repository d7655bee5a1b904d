use crate::foundation::core::Fps;
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::graph::composition::{
    COMPOSITION_VERSION, Composition, CompositionDef, EdgeDef, OperationDef, SourceDef,
};
use crate::texture::PixelFormat;

/// Programmatic alternative to writing composition JSON.
///
/// ```
/// use framegraph::{CompositionBuilder, Fps};
///
/// let comp = CompositionBuilder::new(Fps::new(30, 1)?, 90)
///     .source("clip", 1920, 1080)
///     .op("aa", "fxaa", serde_json::Value::Null)
///     .connect("clip", "aa", 0)
///     .output("aa")
///     .build()?;
/// assert_eq!(comp.duration_frames(), 90);
/// # Ok::<(), framegraph::FramegraphError>(())
/// ```
pub struct CompositionBuilder {
    fps: Fps,
    duration: u64,
    sources: Vec<SourceDef>,
    operations: Vec<OperationDef>,
    edges: Vec<EdgeDef>,
    output: Option<String>,
}

impl CompositionBuilder {
    /// Start a composition `duration` frames long.
    pub fn new(fps: Fps, duration: u64) -> Self {
        Self {
            fps,
            duration,
            sources: Vec::new(),
            operations: Vec::new(),
            edges: Vec::new(),
            output: None,
        }
    }

    /// Start a composition covering `seconds`, rounded up to whole frames.
    pub fn with_duration_secs(fps: Fps, seconds: f64) -> Self {
        Self::new(fps, fps.frames_for_secs(seconds))
    }

    /// Declare a premultiplied RGBA8 source.
    pub fn source(self, id: impl Into<String>, width: u32, height: u32) -> Self {
        self.source_with_format(id, width, height, PixelFormat::Rgba8Premul)
    }

    /// Declare a source with an explicit pixel format.
    pub fn source_with_format(
        mut self,
        id: impl Into<String>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        self.sources.push(SourceDef {
            id: id.into(),
            width,
            height,
            format,
        });
        self
    }

    /// Declare an operation.
    pub fn op(
        mut self,
        id: impl Into<String>,
        kind: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        self.operations.push(OperationDef {
            id: id.into(),
            kind: kind.into(),
            params,
        });
        self
    }

    /// Connect `from` to input `input` of `to`.
    pub fn connect(mut self, from: impl Into<String>, to: impl Into<String>, input: usize) -> Self {
        self.edges.push(EdgeDef {
            from: from.into(),
            to: to.into(),
            input,
        });
        self
    }

    /// Designate the output operation.
    pub fn output(mut self, id: impl Into<String>) -> Self {
        self.output = Some(id.into());
        self
    }

    /// Finish. Only header fields are checked here; structure is validated by the graph builder.
    pub fn build(self) -> FramegraphResult<Composition> {
        let output = self
            .output
            .ok_or_else(|| FramegraphError::validation("composition has no output"))?;
        Composition::from_def(CompositionDef {
            version: COMPOSITION_VERSION.to_owned(),
            fps: self.fps,
            duration: self.duration,
            sources: self.sources,
            operations: self.operations,
            edges: self.edges,
            output,
        })
    }
}

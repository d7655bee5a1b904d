//! Operation kinds and their registry.
//!
//! An operation kind is data: a shader program reference, a fixed arity, a sizing rule, an input
//! compatibility rule and a parameter parser. Graph nodes pair a kind with parsed parameters.

mod builtins;
mod registry;

use std::borrow::Cow;
use std::sync::Arc;

use crate::foundation::core::Extent;
use crate::foundation::error::GraphError;
use crate::texture::TextureDesc;

pub use registry::OperationRegistry;

/// Number of `f32` slots in an operation's parameter block.
pub const PARAM_SLOTS: usize = 24;

/// Reference to a shader program: WGSL source plus its vertex and fragment entry points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderProgram {
    /// Program identifier, also the key CPU kernels are looked up by.
    pub id: Cow<'static, str>,
    /// Vertex entry point (`one_input_vertex` or `two_input_vertex` for the shared prelude).
    pub vertex_entry: Cow<'static, str>,
    /// Fragment entry point.
    pub fragment_entry: Cow<'static, str>,
    /// WGSL body. The shared prelude (bindings, vertex entries, load/store helpers) is prepended
    /// by the GPU backend.
    pub wgsl: Cow<'static, str>,
}

/// How an operation's output size is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputSizing {
    /// Same extent and format as input 0.
    SameAsFirstInput,
    /// Extent taken from the parameters ([`OpParams::fixed_extent`]), format from input 0.
    FromParams,
}

impl OutputSizing {
    /// Resolve the output description, or `None` when the parameters carry no extent.
    pub fn resolve(self, params: &OpParams, inputs: &[TextureDesc]) -> Option<TextureDesc> {
        let first = inputs.first()?;
        match self {
            Self::SameAsFirstInput => Some(*first),
            Self::FromParams => params.fixed_extent().map(|extent| TextureDesc {
                extent,
                format: first.format,
            }),
        }
    }
}

/// Rule inputs of a multi-input operation must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputCompat {
    /// Every input has the same width and height.
    SameExtent,
    /// Every input has the same width, height and pixel format.
    SameExtentAndFormat,
    /// No constraint.
    Any,
}

impl InputCompat {
    /// Check `inputs`, returning a mismatch description on failure.
    pub fn check(self, inputs: &[TextureDesc]) -> Result<(), String> {
        let Some(first) = inputs.first() else {
            return Ok(());
        };
        for (i, d) in inputs.iter().enumerate().skip(1) {
            match self {
                Self::Any => {}
                Self::SameExtent => {
                    if d.extent != first.extent {
                        return Err(format!(
                            "input {i} is {} but input 0 is {}",
                            d.extent, first.extent
                        ));
                    }
                }
                Self::SameExtentAndFormat => {
                    if d != first {
                        return Err(format!("input {i} is {d} but input 0 is {first}"));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parsed, typed operation parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum OpParams {
    /// Kind takes no parameters.
    None,
    /// FXAA tuning.
    Fxaa {
        /// Sub-pixel aliasing removal amount, `0..=1`.
        subpix: f32,
        /// Minimum relative local contrast that counts as an edge.
        edge_threshold: f32,
    },
    /// 4x5 row-major color matrix; column 4 is an offset in normalized units.
    ColorMatrix {
        /// Matrix coefficients.
        matrix: [f32; 20],
    },
    /// Additive brightness.
    Brightness {
        /// Offset added to RGB, `-1..=1`.
        amount: f32,
    },
    /// Saturation scale.
    Saturation {
        /// `0` is grayscale, `1` is identity.
        amount: f32,
    },
    /// Cross-fade between two inputs.
    Mix {
        /// Weight of input 1, `0..=1`.
        t: f32,
    },
    /// Source-over composite of input 1 onto input 0.
    Over {
        /// Extra opacity applied to the foreground, `0..=1`.
        opacity: f32,
    },
    /// Multiply input 0 by the alpha of input 1.
    Mask {
        /// Use `1 - alpha` instead.
        inverted: bool,
    },
    /// Resample to a fixed size.
    Scale {
        /// Output width.
        width: u32,
        /// Output height.
        height: u32,
    },
    /// Raw parameter block for registered custom kinds.
    Custom(Vec<f32>),
}

impl OpParams {
    /// Output extent carried by the parameters, if any.
    pub fn fixed_extent(&self) -> Option<Extent> {
        match self {
            Self::Scale { width, height } => Some(Extent::new(*width, *height)),
            _ => None,
        }
    }

    /// Pack into the fixed-size parameter block shared by all backends.
    pub fn pack(&self) -> [f32; PARAM_SLOTS] {
        let mut out = [0.0f32; PARAM_SLOTS];
        match self {
            Self::None | Self::Scale { .. } => {}
            Self::Fxaa {
                subpix,
                edge_threshold,
            } => {
                out[0] = *subpix;
                out[1] = *edge_threshold;
            }
            Self::ColorMatrix { matrix } => out[..20].copy_from_slice(matrix),
            Self::Brightness { amount } | Self::Saturation { amount } => out[0] = *amount,
            Self::Mix { t } => out[0] = *t,
            Self::Over { opacity } => out[0] = *opacity,
            Self::Mask { inverted } => out[0] = if *inverted { 1.0 } else { 0.0 },
            Self::Custom(v) => {
                let n = v.len().min(PARAM_SLOTS);
                out[..n].copy_from_slice(&v[..n]);
            }
        }
        out
    }
}

/// Parameter parser for one kind. `Value::Null` means "no params given".
pub type ParamParser = fn(&serde_json::Value) -> Result<OpParams, String>;

/// A registered operation variant.
#[derive(Clone, Debug)]
pub struct OperationKind {
    /// Registry key used by compositions (`"fxaa"`, `"mix"`, ...).
    pub name: Cow<'static, str>,
    /// Shader program this kind runs.
    pub program: ShaderProgram,
    /// Exact number of inputs.
    pub arity: usize,
    /// Output sizing rule.
    pub sizing: OutputSizing,
    /// Input compatibility rule.
    pub compat: InputCompat,
    /// Parameter parser.
    pub parse_params: ParamParser,
}

/// A configured operation: identity, kind and parameters. Immutable once built.
#[derive(Clone, Debug)]
pub struct Operation {
    id: String,
    kind: Arc<OperationKind>,
    params: OpParams,
}

impl Operation {
    /// Parse `params` with the kind's parser.
    pub fn new(
        id: impl Into<String>,
        kind: Arc<OperationKind>,
        params: &serde_json::Value,
    ) -> Result<Self, GraphError> {
        let id = id.into();
        let params = (kind.parse_params)(params).map_err(|reason| GraphError::InvalidParams {
            op: id.clone(),
            reason,
        })?;
        Ok(Self { id, kind, params })
    }

    /// Node id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind descriptor.
    pub fn kind(&self) -> &Arc<OperationKind> {
        &self.kind
    }

    /// Parsed parameters.
    pub fn params(&self) -> &OpParams {
        &self.params
    }

    /// Declared arity.
    pub fn arity(&self) -> usize {
        self.kind.arity
    }

    /// Validate input descriptions and resolve the output description.
    pub fn configure(&self, inputs: &[TextureDesc]) -> Result<TextureDesc, GraphError> {
        if inputs.len() != self.kind.arity {
            return Err(GraphError::ArityMismatch {
                op: self.id.clone(),
                expected: self.kind.arity,
                got: inputs.len(),
            });
        }
        self.kind
            .compat
            .check(inputs)
            .map_err(|reason| GraphError::IncompatibleInputs {
                op: self.id.clone(),
                reason,
            })?;
        let out = self.kind.sizing.resolve(&self.params, inputs).ok_or_else(|| {
            GraphError::InvalidParams {
                op: self.id.clone(),
                reason: "sizing rule requires an output extent".to_owned(),
            }
        })?;
        if out.extent.is_empty() {
            return Err(GraphError::InvalidParams {
                op: self.id.clone(),
                reason: format!("output extent {} is empty", out.extent),
            });
        }
        if out.extent.is_oversized() {
            return Err(GraphError::InvalidParams {
                op: self.id.clone(),
                reason: format!(
                    "output extent {} exceeds the {} pixel limit per side",
                    out.extent,
                    Extent::MAX_SIDE
                ),
            });
        }
        Ok(out)
    }
}

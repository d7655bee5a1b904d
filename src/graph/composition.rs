use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::foundation::core::Fps;
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::texture::PixelFormat;

/// Current composition format version.
pub const COMPOSITION_VERSION: &str = "1";

/// JSON boundary model of a composition.
///
/// Node ids share one namespace across `sources` and `operations`. `duration` is in frames.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositionDef {
    /// Format version, must equal [`COMPOSITION_VERSION`].
    pub version: String,
    /// Output frame rate.
    pub fps: Fps,
    /// Timeline length in frames.
    pub duration: u64,
    /// External inputs, one texture per frame each.
    #[serde(default)]
    pub sources: Vec<SourceDef>,
    /// Operations in declaration order.
    pub operations: Vec<OperationDef>,
    /// Connections from a producer to a consumer input.
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
    /// Id of the operation whose texture is the frame result.
    pub output: String,
}

/// External source declaration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDef {
    /// Node id.
    pub id: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format of the supplied textures.
    #[serde(default)]
    pub format: PixelFormat,
}

/// Operation declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationDef {
    /// Node id.
    pub id: String,
    /// Registered kind name.
    pub kind: String,
    /// Kind-specific parameters; omitted means defaults.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// `(producer) -> (consumer, input index)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDef {
    /// Producer node id (source or operation).
    pub from: String,
    /// Consumer operation id.
    pub to: String,
    /// Consumer input index.
    #[serde(default)]
    pub input: usize,
}

/// Composition boundary object: a parsed, not yet validated, graph description.
///
/// Structural validation happens in [`crate::Graph::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    def: CompositionDef,
}

impl Composition {
    /// Parse a composition from a JSON reader.
    pub fn from_reader<R: std::io::Read>(r: R) -> FramegraphResult<Self> {
        let def: CompositionDef = serde_json::from_reader(r)
            .map_err(|e| FramegraphError::serde(format!("parse composition JSON: {e}")))?;
        Self::from_def(def)
    }

    /// Parse a composition from a JSON file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> FramegraphResult<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            FramegraphError::validation(format!(
                "open composition JSON '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_reader(BufReader::new(f))
    }

    /// Wrap a definition after checking the header fields.
    pub fn from_def(def: CompositionDef) -> FramegraphResult<Self> {
        if def.version != COMPOSITION_VERSION {
            return Err(FramegraphError::validation(format!(
                "unsupported composition version '{}', expected '{COMPOSITION_VERSION}'",
                def.version
            )));
        }
        Fps::new(def.fps.num, def.fps.den)?;
        Ok(Self { def })
    }

    /// Serialize back to pretty JSON.
    pub fn to_json(&self) -> FramegraphResult<String> {
        serde_json::to_string_pretty(&self.def)
            .map_err(|e| FramegraphError::serde(format!("serialize composition: {e}")))
    }

    /// Declared duration in frames.
    pub fn duration_frames(&self) -> u64 {
        self.def.duration
    }

    /// Declared frame rate.
    pub fn fps(&self) -> Fps {
        self.def.fps
    }

    /// Borrow the underlying definition.
    pub fn def(&self) -> &CompositionDef {
        &self.def
    }
}

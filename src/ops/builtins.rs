use serde::Deserialize;

use crate::ops::{InputCompat, OpParams, OperationKind, OutputSizing, ShaderProgram};

const ONE_INPUT_VERTEX: &str = "one_input_vertex";
const TWO_INPUT_VERTEX: &str = "two_input_vertex";

fn program(
    id: &'static str,
    vertex: &'static str,
    fragment: &'static str,
    wgsl: &'static str,
) -> ShaderProgram {
    ShaderProgram {
        id: id.into(),
        vertex_entry: vertex.into(),
        fragment_entry: fragment.into(),
        wgsl: wgsl.into(),
    }
}

fn kind(
    name: &'static str,
    program: ShaderProgram,
    arity: usize,
    parse_params: super::ParamParser,
) -> OperationKind {
    OperationKind {
        name: name.into(),
        program,
        arity,
        sizing: OutputSizing::SameAsFirstInput,
        compat: InputCompat::SameExtent,
        parse_params,
    }
}

pub(super) fn all() -> Vec<OperationKind> {
    vec![
        kind(
            "passthrough",
            program(
                "passthrough",
                ONE_INPUT_VERTEX,
                "passthrough_fragment",
                include_str!("../shaders/passthrough.wgsl"),
            ),
            1,
            parse_none,
        ),
        kind(
            "fxaa",
            program(
                "fxaa",
                ONE_INPUT_VERTEX,
                "fxaa_fragment",
                include_str!("../shaders/fxaa.wgsl"),
            ),
            1,
            parse_fxaa,
        ),
        kind(
            "color_matrix",
            program(
                "color_matrix",
                ONE_INPUT_VERTEX,
                "color_matrix_fragment",
                include_str!("../shaders/color_matrix.wgsl"),
            ),
            1,
            parse_color_matrix,
        ),
        kind(
            "brightness",
            program(
                "brightness",
                ONE_INPUT_VERTEX,
                "brightness_fragment",
                include_str!("../shaders/adjust.wgsl"),
            ),
            1,
            parse_brightness,
        ),
        kind(
            "saturation",
            program(
                "saturation",
                ONE_INPUT_VERTEX,
                "saturation_fragment",
                include_str!("../shaders/adjust.wgsl"),
            ),
            1,
            parse_saturation,
        ),
        kind(
            "invert",
            program(
                "invert",
                ONE_INPUT_VERTEX,
                "invert_fragment",
                include_str!("../shaders/adjust.wgsl"),
            ),
            1,
            parse_none,
        ),
        kind(
            "mix",
            program(
                "mix",
                TWO_INPUT_VERTEX,
                "mix_fragment",
                include_str!("../shaders/blend.wgsl"),
            ),
            2,
            parse_mix,
        ),
        kind(
            "over",
            program(
                "over",
                TWO_INPUT_VERTEX,
                "over_fragment",
                include_str!("../shaders/blend.wgsl"),
            ),
            2,
            parse_over,
        ),
        kind(
            "mask",
            program(
                "mask",
                TWO_INPUT_VERTEX,
                "mask_fragment",
                include_str!("../shaders/blend.wgsl"),
            ),
            2,
            parse_mask,
        ),
        OperationKind {
            sizing: OutputSizing::FromParams,
            ..kind(
                "scale",
                program(
                    "scale",
                    ONE_INPUT_VERTEX,
                    "passthrough_fragment",
                    include_str!("../shaders/passthrough.wgsl"),
                ),
                1,
                parse_scale,
            )
        },
    ]
}

fn from_value<T: for<'de> Deserialize<'de> + Default>(v: &serde_json::Value) -> Result<T, String> {
    if v.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(v.clone()).map_err(|e| e.to_string())
}

fn check_range(name: &str, v: f32, lo: f32, hi: f32) -> Result<f32, String> {
    if !v.is_finite() || v < lo || v > hi {
        return Err(format!("{name} must be in [{lo}, {hi}], got {v}"));
    }
    Ok(v)
}

fn parse_none(v: &serde_json::Value) -> Result<OpParams, String> {
    match v {
        serde_json::Value::Null => Ok(OpParams::None),
        serde_json::Value::Object(m) if m.is_empty() => Ok(OpParams::None),
        _ => Err("operation takes no parameters".to_owned()),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct FxaaParams {
    subpix: f32,
    edge_threshold: f32,
}

impl Default for FxaaParams {
    fn default() -> Self {
        Self {
            subpix: 0.75,
            edge_threshold: 0.166,
        }
    }
}

fn parse_fxaa(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: FxaaParams = from_value(v)?;
    Ok(OpParams::Fxaa {
        subpix: check_range("subpix", p.subpix, 0.0, 1.0)?,
        edge_threshold: check_range("edge_threshold", p.edge_threshold, 0.0, 1.0)?,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ColorMatrixParams {
    matrix: Vec<f32>,
}

impl Default for ColorMatrixParams {
    fn default() -> Self {
        let mut matrix = vec![0.0; 20];
        for i in 0..4 {
            matrix[i * 5 + i] = 1.0;
        }
        Self { matrix }
    }
}

fn parse_color_matrix(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: ColorMatrixParams = from_value(v)?;
    let matrix: [f32; 20] = p
        .matrix
        .as_slice()
        .try_into()
        .map_err(|_| format!("matrix must have 20 entries, got {}", p.matrix.len()))?;
    if matrix.iter().any(|m| !m.is_finite()) {
        return Err("matrix entries must be finite".to_owned());
    }
    Ok(OpParams::ColorMatrix { matrix })
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct AmountParams {
    amount: Option<f32>,
}

fn parse_brightness(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: AmountParams = from_value(v)?;
    Ok(OpParams::Brightness {
        amount: check_range("amount", p.amount.unwrap_or(0.0), -1.0, 1.0)?,
    })
}

fn parse_saturation(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: AmountParams = from_value(v)?;
    Ok(OpParams::Saturation {
        amount: check_range("amount", p.amount.unwrap_or(1.0), 0.0, f32::MAX)?,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct MixParams {
    t: f32,
}

impl Default for MixParams {
    fn default() -> Self {
        Self { t: 0.5 }
    }
}

fn parse_mix(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: MixParams = from_value(v)?;
    Ok(OpParams::Mix {
        t: check_range("t", p.t, 0.0, 1.0)?,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct OverParams {
    opacity: f32,
}

impl Default for OverParams {
    fn default() -> Self {
        Self { opacity: 1.0 }
    }
}

fn parse_over(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: OverParams = from_value(v)?;
    Ok(OpParams::Over {
        opacity: check_range("opacity", p.opacity, 0.0, 1.0)?,
    })
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct MaskParams {
    inverted: bool,
}

fn parse_mask(v: &serde_json::Value) -> Result<OpParams, String> {
    let p: MaskParams = from_value(v)?;
    Ok(OpParams::Mask {
        inverted: p.inverted,
    })
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ScaleParams {
    width: u32,
    height: u32,
}

fn parse_scale(v: &serde_json::Value) -> Result<OpParams, String> {
    if v.is_null() {
        return Err("scale requires width and height".to_owned());
    }
    let p: ScaleParams = from_value(v)?;
    if p.width == 0 || p.height == 0 {
        return Err(format!(
            "scale size must be non-zero, got {}x{}",
            p.width, p.height
        ));
    }
    Ok(OpParams::Scale {
        width: p.width,
        height: p.height,
    })
}

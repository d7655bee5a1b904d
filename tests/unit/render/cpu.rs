use super::*;
use crate::foundation::core::Extent;
use crate::ops::{InputCompat, OpParams, OperationKind, OperationRegistry, OutputSizing, ShaderProgram};
use crate::texture::PixelFormat;
use serde_json::{Value, json};

fn op(kind: &str, params: Value) -> Operation {
    let reg = OperationRegistry::with_builtins();
    Operation::new(kind, reg.get(kind).unwrap(), &params).unwrap()
}

fn solid(w: u32, h: u32, rgba: [u8; 4]) -> Texture {
    Texture::solid(TextureDesc::rgba8_premul(w, h), rgba).unwrap()
}

fn run(op: &Operation, inputs: &[Texture]) -> Texture {
    let mut be = CpuBackend::new(CpuBackendOpts::default());
    be.prepare(op).unwrap();
    let mut slots = Vec::new();
    for (i, t) in inputs.iter().enumerate() {
        be.upload(SlotId(i as u32), t).unwrap();
        slots.push(SlotId(i as u32));
    }
    let descs: Vec<TextureDesc> = inputs.iter().map(Texture::desc).collect();
    let out_desc = op.configure(&descs).unwrap();
    let out = SlotId(inputs.len() as u32);
    be.execute(op, &slots, out, out_desc).unwrap();
    be.readback(out).unwrap()
}

#[test]
fn passthrough_preserves_opaque_and_clear_pixels() {
    let desc = TextureDesc::rgba8_premul(5, 3);
    let t = Texture::from_fn(desc, |x, y| {
        if (x + y) % 2 == 0 {
            [x as u8 * 50, y as u8 * 80, 17, 255]
        } else {
            [0, 0, 0, 0]
        }
    })
    .unwrap();
    assert_eq!(run(&op("passthrough", Value::Null), std::slice::from_ref(&t)), t);
}

#[test]
fn invert_flips_color_keeps_alpha() {
    let out = run(&op("invert", Value::Null), &[solid(2, 2, [10, 20, 30, 255])]);
    assert_eq!(out.pixel(1, 1), Some([245, 235, 225, 255]));
}

#[test]
fn fxaa_leaves_flat_regions_alone() {
    let t = solid(6, 4, [90, 120, 200, 255]);
    assert_eq!(run(&op("fxaa", Value::Null), std::slice::from_ref(&t)), t);
}

#[test]
fn fxaa_softens_a_hard_vertical_edge() {
    let desc = TextureDesc::rgba8_premul(8, 4);
    let t = Texture::from_fn(desc, |x, _| {
        if x < 4 { [0, 0, 0, 255] } else { [255, 255, 255, 255] }
    })
    .unwrap();
    let out = run(&op("fxaa", Value::Null), &[t]);
    assert_eq!(out.extent(), Extent::new(8, 4));
    assert_eq!(out.pixel(3, 1), Some([64, 64, 64, 255]));
    assert_eq!(out.pixel(0, 1), Some([0, 0, 0, 255]));
    assert_eq!(out.pixel(7, 1), Some([255, 255, 255, 255]));
}

#[test]
fn color_matrix_identity_with_offset() {
    let mut m = [0.0f32; 20];
    for i in 0..4 {
        m[i * 5 + i] = 1.0;
    }
    m[4] = 1.0;
    let out = run(
        &op("color_matrix", json!({ "matrix": m })),
        &[solid(1, 1, [0, 40, 80, 255])],
    );
    assert_eq!(out.pixel(0, 0), Some([255, 40, 80, 255]));
}

#[test]
fn saturation_zero_is_grayscale() {
    let out = run(
        &op("saturation", json!({ "amount": 0.0 })),
        &[solid(1, 1, [255, 0, 0, 255])],
    );
    let [r, g, b, a] = out.pixel(0, 0).unwrap();
    assert_eq!((r, a), (76, 255));
    assert_eq!(r, g);
    assert_eq!(g, b);
}

#[test]
fn brightness_clamps() {
    let out = run(
        &op("brightness", json!({ "amount": 0.5 })),
        &[solid(1, 1, [200, 0, 0, 255])],
    );
    assert_eq!(out.pixel(0, 0), Some([255, 128, 128, 255]));
}

#[test]
fn mix_halfway_between_black_and_white() {
    let out = run(
        &op("mix", json!({ "t": 0.5 })),
        &[solid(2, 2, [0, 0, 0, 255]), solid(2, 2, [255, 255, 255, 255])],
    );
    assert_eq!(out.pixel(0, 0), Some([128, 128, 128, 255]));
}

#[test]
fn over_composites_foreground_on_background() {
    let bg = solid(2, 2, [0, 0, 255, 255]);
    let opaque_red = run(
        &op("over", Value::Null),
        &[bg.clone(), solid(2, 2, [255, 0, 0, 255])],
    );
    assert_eq!(opaque_red.pixel(1, 0), Some([255, 0, 0, 255]));

    let clear = run(&op("over", Value::Null), &[bg.clone(), solid(2, 2, [0, 0, 0, 0])]);
    assert_eq!(clear, bg);
}

#[test]
fn mask_uses_alpha_of_second_input() {
    let src = solid(2, 2, [255, 255, 255, 255]);
    let hole = solid(2, 2, [0, 0, 0, 0]);
    assert_eq!(
        run(&op("mask", Value::Null), &[src.clone(), hole.clone()]).pixel(0, 0),
        Some([0, 0, 0, 0])
    );
    assert_eq!(
        run(&op("mask", json!({ "inverted": true })), &[src.clone(), hole]),
        src
    );
}

#[test]
fn scale_resamples_to_requested_size() {
    let out = run(
        &op("scale", json!({ "width": 3, "height": 1 })),
        &[solid(6, 2, [12, 34, 56, 255])],
    );
    assert_eq!(out.desc(), TextureDesc::rgba8_premul(3, 1));
    assert_eq!(out.pixel(2, 0), Some([12, 34, 56, 255]));
}

#[test]
fn output_format_follows_first_input() {
    let desc = TextureDesc {
        extent: Extent::new(1, 1),
        format: PixelFormat::Rgba8Unorm,
    };
    let straight = Texture::solid(desc, [200, 100, 0, 128]).unwrap();
    let out = run(&op("passthrough", Value::Null), &[straight.clone()]);
    assert_eq!(out, straight);
}

#[test]
fn rendering_is_deterministic() {
    let desc = TextureDesc::rgba8_premul(17, 9);
    let t = Texture::from_fn(desc, |x, y| {
        let v = ((x * 31 + y * 17) % 256) as u8;
        [v, v / 2, 255 - v, 255]
    })
    .unwrap();
    let a = run(&op("fxaa", Value::Null), std::slice::from_ref(&t));
    let b = run(&op("fxaa", Value::Null), std::slice::from_ref(&t));
    assert_eq!(a.digest(), b.digest());
}

#[test]
fn unknown_program_needs_registered_kernel() {
    let kind = OperationKind {
        name: "tint".into(),
        program: ShaderProgram {
            id: "tint".into(),
            vertex_entry: "one_input_vertex".into(),
            fragment_entry: "tint_fragment".into(),
            wgsl: "".into(),
        },
        arity: 1,
        sizing: OutputSizing::SameAsFirstInput,
        compat: InputCompat::SameExtent,
        parse_params: |_| Ok(OpParams::Custom(vec![1.0])),
    };
    let tint = Operation::new("t", Arc::new(kind), &Value::Null).unwrap();

    let mut be = CpuBackend::new(CpuBackendOpts::default());
    assert_eq!(
        be.prepare(&tint),
        Err(ResourceError::ShaderNotFound {
            program: "tint".to_owned()
        })
    );

    be.register_kernel(
        "tint",
        Arc::new(|ctx: &KernelCtx<'_>, x: u32, y: u32| {
            let (u, v) = ctx.uv(x, y);
            let c = ctx.input(0).sample(u, v);
            [ctx.param(0), c[1], c[2], c[3]]
        }),
    );
    be.prepare(&tint).unwrap();
    be.upload(SlotId(0), &solid(1, 1, [0, 0, 0, 255])).unwrap();
    be.execute(&tint, &[SlotId(0)], SlotId(1), TextureDesc::rgba8_premul(1, 1))
        .unwrap();
    assert_eq!(be.readback(SlotId(1)).unwrap().pixel(0, 0), Some([255, 0, 0, 255]));
}

#[test]
fn execute_without_prepare_fails() {
    let mut be = CpuBackend::new(CpuBackendOpts::default());
    be.upload(SlotId(0), &solid(1, 1, [0, 0, 0, 255])).unwrap();
    let err = be
        .execute(
            &op("invert", Value::Null),
            &[SlotId(0)],
            SlotId(1),
            TextureDesc::rgba8_premul(1, 1),
        )
        .unwrap_err();
    assert!(matches!(err, RenderError::Backend(_)));
}

#[test]
fn released_slots_return_to_pool() {
    let mut be = CpuBackend::new(CpuBackendOpts::default());
    let t = solid(4, 4, [1, 2, 3, 255]);
    be.upload(SlotId(0), &t).unwrap();
    be.upload(SlotId(1), &t).unwrap();
    assert_eq!(be.live_slots(), 2);
    be.release(SlotId(0));
    be.release(SlotId(0));
    assert_eq!(be.live_slots(), 1);
    be.upload(SlotId(2), &t).unwrap();
    assert_eq!(be.pool_stats().alloc_surfaces, 2);

    be.reset_resources().unwrap();
    assert_eq!(be.live_slots(), 0);
    assert_eq!(be.pool_stats().retained_surfaces, 0);
}

#[test]
fn unallocatable_output_is_out_of_memory() {
    let scale = op("scale", json!({ "width": u32::MAX, "height": u32::MAX }));
    let mut be = CpuBackend::new(CpuBackendOpts::default());
    be.prepare(&scale).unwrap();
    be.upload(SlotId(0), &solid(4, 4, [1, 2, 3, 255])).unwrap();

    let err = be
        .execute(
            &scale,
            &[SlotId(0)],
            SlotId(1),
            TextureDesc::rgba8_premul(u32::MAX, u32::MAX),
        )
        .unwrap_err();
    assert!(matches!(err, RenderError::OutOfMemory(_)), "{err:?}");
    assert_eq!(be.live_slots(), 1);
}

use super::*;

#[test]
fn fnv_seeded_hash_is_stable() {
    let mut a = Fnv1a64::new_default();
    a.write_bytes(b"framegraph");
    let mut b = Fnv1a64::new(Fnv1a64::OFFSET_BASIS);
    b.write_u8(b'f');
    b.write_bytes(b"ramegraph");
    assert_eq!(a.finish(), b.finish());
}

#[test]
fn mul_div255_variants_align() {
    for x in [0u16, 1, 127, 255] {
        for y in [0u16, 1, 127, 255] {
            assert_eq!(u16::from(mul_div255_u8(x, y)), mul_div255_u16(x, y));
        }
    }
}

#[test]
fn unorm_quantization_clamps_and_rounds() {
    assert_eq!(unorm_to_u8(-0.5), 0);
    assert_eq!(unorm_to_u8(2.0), 255);
    assert_eq!(unorm_to_u8(f32::NAN), 0);
    for v in [0u8, 1, 64, 128, 254, 255] {
        assert_eq!(unorm_to_u8(u8_to_unorm(v)), v);
    }
}

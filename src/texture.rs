use std::path::Path;

use anyhow::Context as _;

use crate::foundation::core::Extent;
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::foundation::math::{Fnv1a64, mul_div255_u8};

/// Pixel storage layout of a [`Texture`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// RGBA8, premultiplied alpha.
    #[default]
    Rgba8Premul,
    /// RGBA8, straight (unassociated) alpha.
    Rgba8Unorm,
}

impl PixelFormat {
    /// Bytes per pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8Premul | Self::Rgba8Unorm => 4,
        }
    }

    /// `true` when color channels are stored premultiplied by alpha.
    pub fn is_premultiplied(self) -> bool {
        matches!(self, Self::Rgba8Premul)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rgba8Premul => "rgba8_premul",
            Self::Rgba8Unorm => "rgba8_unorm",
        };
        f.write_str(s)
    }
}

/// Dimensions and format of a 2D pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TextureDesc {
    /// Pixel dimensions.
    pub extent: Extent,
    /// Storage format.
    #[serde(default)]
    pub format: PixelFormat,
}

impl TextureDesc {
    /// Premultiplied RGBA8 description of the given size.
    pub const fn rgba8_premul(width: u32, height: u32) -> Self {
        Self {
            extent: Extent::new(width, height),
            format: PixelFormat::Rgba8Premul,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    /// Size of a tightly packed buffer for this description.
    pub fn byte_len(&self) -> usize {
        self.extent
            .pixel_count()
            .saturating_mul(self.format.bytes_per_pixel())
    }
}

impl std::fmt::Display for TextureDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.extent, self.format)
    }
}

/// Host-side pixel buffer, tightly packed and row-major.
///
/// This is the currency at the render pipeline boundary: sources are uploaded from it and the
/// final output is read back into it. Backends keep their own device-side storage in between.
#[derive(Clone, PartialEq, Eq)]
pub struct Texture {
    desc: TextureDesc,
    data: Vec<u8>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("desc", &self.desc)
            .field("digest", &format_args!("{:016x}", self.digest()))
            .finish()
    }
}

impl Texture {
    /// Wrap existing bytes. `data.len()` must match `desc.byte_len()`.
    pub fn new(desc: TextureDesc, data: Vec<u8>) -> FramegraphResult<Self> {
        if desc.extent.is_empty() {
            return Err(FramegraphError::validation(format!(
                "texture must have non-zero size, got {}",
                desc.extent
            )));
        }
        if data.len() != desc.byte_len() {
            return Err(FramegraphError::validation(format!(
                "texture data length {} does not match {desc} ({} bytes)",
                data.len(),
                desc.byte_len()
            )));
        }
        Ok(Self { desc, data })
    }

    /// Texture filled with one RGBA value (interpreted in `desc.format`).
    pub fn solid(desc: TextureDesc, rgba: [u8; 4]) -> FramegraphResult<Self> {
        let data = rgba.repeat(desc.extent.pixel_count());
        Self::new(desc, data)
    }

    /// Build a texture by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        desc: TextureDesc,
        mut f: impl FnMut(u32, u32) -> [u8; 4],
    ) -> FramegraphResult<Self> {
        let mut data = Vec::with_capacity(desc.byte_len());
        for y in 0..desc.height() {
            for x in 0..desc.width() {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self::new(desc, data)
    }

    /// Decode a PNG (or any format enabled on `image`) into a straight-alpha texture.
    pub fn load_png(path: &Path) -> FramegraphResult<Self> {
        let img = image::open(path)
            .with_context(|| format!("decode image '{}'", path.display()))?
            .to_rgba8();
        let (w, h) = img.dimensions();
        Self::new(
            TextureDesc {
                extent: Extent::new(w, h),
                format: PixelFormat::Rgba8Unorm,
            },
            img.into_raw(),
        )
    }

    /// Encode as PNG with straight alpha.
    pub fn save_png(&self, path: &Path) -> FramegraphResult<()> {
        let straight = self.to_straight_rgba();
        image::save_buffer_with_format(
            path,
            &straight,
            self.desc.width(),
            self.desc.height(),
            image::ExtendedColorType::Rgba8,
            image::ImageFormat::Png,
        )
        .with_context(|| format!("write png '{}'", path.display()))?;
        Ok(())
    }

    /// Description of this buffer.
    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    /// Pixel dimensions.
    pub fn extent(&self) -> Extent {
        self.desc.extent
    }

    /// Raw bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume into raw bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// RGBA value at `(x, y)`, or `None` outside the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.desc.width() || y >= self.desc.height() {
            return None;
        }
        let i = (y as usize * self.desc.width() as usize + x as usize) * 4;
        let p = self.data.get(i..i + 4)?;
        Some([p[0], p[1], p[2], p[3]])
    }

    /// Content digest over description and bytes.
    pub fn digest(&self) -> u64 {
        let mut h = Fnv1a64::new_default();
        h.write_u32(self.desc.width());
        h.write_u32(self.desc.height());
        h.write_u8(match self.desc.format {
            PixelFormat::Rgba8Premul => 0,
            PixelFormat::Rgba8Unorm => 1,
        });
        h.write_bytes(&self.data);
        h.finish()
    }

    /// Copy of the pixels with straight alpha.
    pub fn to_straight_rgba(&self) -> Vec<u8> {
        if !self.desc.format.is_premultiplied() {
            return self.data.clone();
        }
        let mut out = self.data.clone();
        for px in out.chunks_exact_mut(4) {
            let a = u16::from(px[3]);
            if a == 0 {
                px[0] = 0;
                px[1] = 0;
                px[2] = 0;
                continue;
            }
            for c in &mut px[..3] {
                *c = ((u16::from(*c) * 255 + a / 2) / a).min(255) as u8;
            }
        }
        out
    }

    /// Copy of the pixels composited over opaque black, alpha forced to 255.
    pub fn to_opaque_rgba(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        let premul = self.desc.format.is_premultiplied();
        for px in out.chunks_exact_mut(4) {
            if !premul {
                let a = u16::from(px[3]);
                for c in &mut px[..3] {
                    *c = mul_div255_u8(u16::from(*c), a);
                }
            }
            px[3] = 255;
        }
        out
    }
}

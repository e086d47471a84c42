use crate::detector::Prediction;
use anyhow::bail;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use image::ImageBuffer;
use jpeg_encoder::{ColorType, Encoder};
use std::{fmt, path::Path, time::Instant};
use tracing::debug;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

/// An RGB raster with tightly packed 3-byte pixels.
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolution: {}x{}", self.width, self.height)
    }
}

impl Default for Image {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        }
    }
}

pub fn is_jpeg(image_path: &Path) -> bool {
    matches!(
        image_path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(|extension| extension.to_lowercase()),
        Some(ref extension) if extension == "jpg" || extension == "jpeg"
    )
}

/// Decodes the file at `path` into an RGB raster. JPEG files take the fast
/// zune decode path, everything else goes through the generic image decoder.
pub fn decode_image(path: &Path, image: &mut Image) -> anyhow::Result<()> {
    let bytes = Bytes::from(std::fs::read(path)?);
    if is_jpeg(path) {
        decode_jpeg(bytes, image)
    } else {
        decode_generic(bytes, image)
    }
}

pub fn decode_jpeg(jpeg: Bytes, image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .set_use_unsafe(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg.as_ref(), options);
    // We need to decode the headers first to get the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow::anyhow!("Failed to get decoder output buffer size"))?;
    image.resize(output_buffer_size);
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow::anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    Ok(())
}

fn decode_generic(bytes: Bytes, image: &mut Image) -> anyhow::Result<()> {
    let decoded = image::load_from_memory(bytes.as_ref())?.to_rgb8();
    image.width = decoded.width() as usize;
    image.height = decoded.height() as usize;
    image.pixels.clear();
    image.pixels.extend_from_slice(decoded.as_raw());
    Ok(())
}

/// Copies the boxed region of `src` into `crop`. Bounds are truncated to
/// whole pixels and clamped to the raster; an empty region is an error.
pub fn crop_region(
    src: &Image,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    crop: &mut Image,
) -> anyhow::Result<()> {
    let x_min = (x1.max(0.0) as usize).min(src.width);
    let y_min = (y1.max(0.0) as usize).min(src.height);
    let x_max = (x2.max(0.0) as usize).min(src.width);
    let y_max = (y2.max(0.0) as usize).min(src.height);

    if x_min >= x_max || y_min >= y_max {
        bail!(
            "Empty crop region ({x1}, {y1}, {x2}, {y2}) for a {}x{} image",
            src.width,
            src.height
        );
    }

    crop.width = x_max - x_min;
    crop.height = y_max - y_min;
    crop.pixels.clear();
    crop.pixels.reserve(crop.width * crop.height * 3);
    for row in y_min..y_max {
        let start = (row * src.width + x_min) * 3;
        let end = start + crop.width * 3;
        crop.pixels.extend_from_slice(&src.pixels[start..end]);
    }
    Ok(())
}

/// Returns a copy of `decoded_image` with a hollow box drawn over every
/// prediction.
pub fn annotate_image(
    decoded_image: &Image,
    predictions: &[Prediction],
) -> anyhow::Result<Image> {
    let mut img = ImageBuffer::from_vec(
        decoded_image.width as u32,
        decoded_image.height as u32,
        decoded_image.pixels.clone(),
    )
    .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;

    for prediction in predictions {
        let dx = (prediction.x_max - prediction.x_min) as i32;
        let dy = (prediction.y_max - prediction.y_min) as i32;

        if dx > 0 && dy > 0 {
            imageproc::drawing::draw_hollow_rect_mut(
                &mut img,
                imageproc::rect::Rect::at(prediction.x_min as i32, prediction.y_min as i32)
                    .of_size(dx as u32, dy as u32),
                image::Rgb([255, 0, 0]),
            );
        }
    }

    Ok(Image {
        width: decoded_image.width,
        height: decoded_image.height,
        pixels: img.into_raw(),
    })
}

/// Encodes the raster as JPEG and wraps it in a base64 data URL.
pub fn encode_jpeg_data_url(image: &Image) -> anyhow::Result<String> {
    let encode_image_start_time = Instant::now();
    let mut jpeg = Vec::new();
    let encoder = Encoder::new(&mut jpeg, 100);
    encoder.encode(
        &image.pixels,
        image.width as u16,
        image.height as u16,
        ColorType::Rgb,
    )?;
    let encode_image_time = Instant::now().duration_since(encode_image_start_time);
    debug!(?encode_image_time, "Encode image time");
    Ok(format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(&jpeg)
    ))
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: 640,
            target_height: 640,
        }
    }
}

impl Resizer {
    pub fn new(target_width: usize, target_height: usize) -> anyhow::Result<Self> {
        if target_width == 0 || target_height == 0 {
            bail!("Resize target must be non-empty, got {target_width}x{target_height}");
        }
        Ok(Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width,
            target_height,
        })
    }

    pub fn resize_image(
        &mut self,
        original_image: &mut Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::Image::from_slice_u8(
            original_image.width as u32,
            original_image.height as u32,
            &mut original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        resized_image.width = self.target_width;
        resized_image.height = self.target_height;
        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}

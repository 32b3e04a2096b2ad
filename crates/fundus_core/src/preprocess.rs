//! Raw image to model input tensor.
//!
//! Every model in the ensemble takes the same input: the image resized (not
//! cropped) to a square, coerced to RGB, scaled to `[0, 1]` and laid out as a
//! single-image NHWC batch of shape `(1, size, size, 3)`.

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::PreprocessError;

/// Side length the ensemble models were trained on.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// Largest square side accepted from configuration.
pub const MAX_INPUT_SIZE: u32 = 4096;

/// Channels per pixel in the model input.
pub const INPUT_CHANNELS: usize = 3;

/// Already-decoded interleaved 8-bit pixels, e.g. from a camera frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPixels {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

/// Where the image to classify comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Encoded image bytes (PNG, JPEG, ...).
    Bytes(Vec<u8>),
    Path(PathBuf),
    Pixels(RawPixels),
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for ImageSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<RawPixels> for ImageSource {
    fn from(pixels: RawPixels) -> Self {
        Self::Pixels(pixels)
    }
}

/// Resampling filter used when resizing to the model input size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    #[default]
    CatmullRom,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Normalized model input of shape `(1, height, width, 3)`.
///
/// Shared read-only by all classifiers of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    /// Wraps an existing array without checking its shape; classifiers
    /// reject shapes they cannot consume.
    pub fn from_array(data: Array4<f32>) -> Self {
        Self { data }
    }

    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// Expected shape for a square input of `size` pixels.
    pub fn expected_shape(size: u32) -> [usize; 4] {
        [1, size as usize, size as usize, INPUT_CHANNELS]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePreprocessor {
    size: u32,
    filter: ResizeFilter,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE, ResizeFilter::default())
    }
}

impl ImagePreprocessor {
    pub fn new(size: u32, filter: ResizeFilter) -> Self {
        Self { size, filter }
    }

    pub fn input_size(&self) -> u32 {
        self.size
    }

    pub fn preprocess(&self, source: &ImageSource) -> Result<ImageTensor, PreprocessError> {
        let img = decode(source)?;
        self.preprocess_image(&img)
    }

    pub fn preprocess_image(&self, img: &DynamicImage) -> Result<ImageTensor, PreprocessError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(PreprocessError::Decode("image has no pixels".into()));
        }
        let rgb = to_rgb(img)?;
        let resized = imageops::resize(&rgb, self.size, self.size, self.filter.into());
        let side = self.size as usize;
        let mut array = Array4::<f32>::zeros((1, side, side, INPUT_CHANNELS));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (row, col) = (y as usize, x as usize);
            array[[0, row, col, 0]] = scale_channel(r);
            array[[0, row, col, 1]] = scale_channel(g);
            array[[0, row, col, 2]] = scale_channel(b);
        }
        Ok(ImageTensor::from_array(array))
    }
}

/// Decodes any supported source into an image without resizing it.
pub fn decode(source: &ImageSource) -> Result<DynamicImage, PreprocessError> {
    match source {
        ImageSource::Bytes(bytes) => decode_bytes(bytes),
        ImageSource::Path(path) => {
            let bytes = fs::read(path).map_err(|source| PreprocessError::Io {
                path: path.clone(),
                source,
            })?;
            decode_bytes(&bytes)
        }
        ImageSource::Pixels(pixels) => from_raw_pixels(pixels),
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    image::load_from_memory(bytes).map_err(|e| PreprocessError::Decode(e.to_string()))
}

fn from_raw_pixels(pixels: &RawPixels) -> Result<DynamicImage, PreprocessError> {
    let RawPixels {
        width,
        height,
        channels,
        data,
    } = pixels;
    if !(1..=4).contains(channels) {
        return Err(PreprocessError::ChannelMismatch(format!(
            "unsupported channel count {channels}"
        )));
    }
    let expected = *width as usize * *height as usize * *channels as usize;
    if data.len() != expected {
        return Err(PreprocessError::ChannelMismatch(format!(
            "{} bytes for {width}x{height} with {channels} channels, expected {expected}",
            data.len()
        )));
    }
    let data = data.clone();
    let img = match channels {
        1 => GrayImage::from_raw(*width, *height, data).map(DynamicImage::ImageLuma8),
        2 => GrayAlphaImage::from_raw(*width, *height, data).map(DynamicImage::ImageLumaA8),
        3 => RgbImage::from_raw(*width, *height, data).map(DynamicImage::ImageRgb8),
        _ => RgbaImage::from_raw(*width, *height, data).map(DynamicImage::ImageRgba8),
    };
    img.ok_or_else(|| PreprocessError::ChannelMismatch("pixel buffer does not fit dimensions".into()))
}

fn to_rgb(img: &DynamicImage) -> Result<RgbImage, PreprocessError> {
    match img {
        DynamicImage::ImageRgb8(rgb) => Ok(rgb.clone()),
        DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_)
        | DynamicImage::ImageRgb32F(_)
        | DynamicImage::ImageRgba32F(_) => Ok(img.to_rgb8()),
        other => Err(PreprocessError::ChannelMismatch(format!(
            "unsupported color layout {:?}",
            other.color()
        ))),
    }
}

fn scale_channel(value: u8) -> f32 {
    value as f32 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageFormat, Rgb};
    use rstest::rstest;
    use std::io::Cursor;

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn preprocess_produces_nhwc_batch_in_unit_range() {
        let img = RgbImage::from_pixel(640, 480, Rgb([255, 0, 51]));
        let source = ImageSource::Bytes(png_bytes(&DynamicImage::ImageRgb8(img)));
        let tensor = ImagePreprocessor::default().preprocess(&source).unwrap();
        assert_eq!(tensor.shape(), [1, 224, 224, 3]);
        let view = tensor.view();
        assert_relative_eq!(view[[0, 10, 10, 0]], 1.0);
        assert_relative_eq!(view[[0, 10, 10, 1]], 0.0);
        assert_relative_eq!(view[[0, 223, 223, 2]], 0.2);
        assert!(view.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn grayscale_is_replicated_to_three_channels() {
        let pixels = RawPixels {
            width: 4,
            height: 4,
            channels: 1,
            data: vec![102; 16],
        };
        let tensor = ImagePreprocessor::new(8, ResizeFilter::Nearest)
            .preprocess(&pixels.into())
            .unwrap();
        assert_eq!(tensor.shape(), [1, 8, 8, 3]);
        for c in 0..3 {
            assert_relative_eq!(tensor.view()[[0, 3, 5, c]], 0.4);
        }
    }

    #[test]
    fn rgba_drops_alpha() {
        let pixels = RawPixels {
            width: 2,
            height: 1,
            channels: 4,
            data: vec![0, 255, 0, 10, 0, 255, 0, 200],
        };
        let tensor = ImagePreprocessor::new(2, ResizeFilter::Nearest)
            .preprocess(&pixels.into())
            .unwrap();
        assert_eq!(tensor.shape(), [1, 2, 2, 3]);
        assert_relative_eq!(tensor.view()[[0, 0, 0, 1]], 1.0);
        assert_relative_eq!(tensor.view()[[0, 0, 0, 0]], 0.0);
    }

    #[rstest]
    #[case(5, 2 * 2 * 5)]
    #[case(0, 0)]
    #[case(3, 2 * 2 * 3 - 1)]
    fn malformed_pixels_are_channel_mismatch(#[case] channels: u8, #[case] len: usize) {
        let pixels = RawPixels {
            width: 2,
            height: 2,
            channels,
            data: vec![0; len],
        };
        let err = ImagePreprocessor::default()
            .preprocess(&pixels.into())
            .unwrap_err();
        assert!(matches!(err, PreprocessError::ChannelMismatch(_)), "{err:?}");
    }

    #[test]
    fn garbage_bytes_are_decode_error() {
        let err = ImagePreprocessor::default()
            .preprocess(&ImageSource::from(&b"definitely not a fundus photo"[..]))
            .unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImagePreprocessor::default()
            .preprocess(&ImageSource::from(dir.path().join("missing.png")))
            .unwrap_err();
        assert!(matches!(err, PreprocessError::Io { .. }));
    }

    #[test]
    fn preprocessing_is_deterministic() {
        let img = RgbImage::from_fn(97, 61, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 128]));
        let bytes = png_bytes(&DynamicImage::ImageRgb8(img));
        let pre = ImagePreprocessor::default();
        let a = pre.preprocess(&ImageSource::Bytes(bytes.clone())).unwrap();
        let b = pre.preprocess(&ImageSource::Bytes(bytes)).unwrap();
        assert_eq!(a, b);
    }
}

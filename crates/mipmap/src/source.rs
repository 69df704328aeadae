use std::fs;
use std::path::Path;

use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

use crate::error::MipmapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MipSize {
    pub width: u32,
    pub height: u32,
}

impl MipSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn max_dimension(self) -> u32 {
        self.width.max(self.height)
    }

    /// Next coarser size: each dimension halves with floor and never drops below 1.
    pub fn halved(self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }

    pub fn at_level(self, level: usize) -> Self {
        (0..level).fold(self, |size, _| size.halved())
    }
}

/// Index of the coarsest level: halving stops once both dimensions fit `min_mip_size`.
pub fn max_level_for(native: MipSize, min_mip_size: u32) -> usize {
    let min_mip_size = min_mip_size.max(1);
    let mut size = native;
    let mut level = 0;
    while size.max_dimension() > min_mip_size {
        size = size.halved();
        level += 1;
    }
    level
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    L8,
    La8,
    Rgb8,
    Rgba8,
    L16,
    La16,
    Rgb16,
    Rgba16,
    Rgb32F,
    Rgba32F,
    Bc1,
    Bc3,
    Other,
}

impl From<ColorType> for PixelFormat {
    fn from(color: ColorType) -> Self {
        match color {
            ColorType::L8 => PixelFormat::L8,
            ColorType::La8 => PixelFormat::La8,
            ColorType::Rgb8 => PixelFormat::Rgb8,
            ColorType::Rgba8 => PixelFormat::Rgba8,
            ColorType::L16 => PixelFormat::L16,
            ColorType::La16 => PixelFormat::La16,
            ColorType::Rgb16 => PixelFormat::Rgb16,
            ColorType::Rgba16 => PixelFormat::Rgba16,
            ColorType::Rgb32F => PixelFormat::Rgb32F,
            ColorType::Rgba32F => PixelFormat::Rgba32F,
            _ => PixelFormat::Other,
        }
    }
}

/// Native dimensions and pixel format of a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub size: MipSize,
    pub pixel_format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressedFormat {
    Bc1,
    Bc3,
}

impl CompressedFormat {
    pub fn pixel_format(self) -> PixelFormat {
        match self {
            CompressedFormat::Bc1 => PixelFormat::Bc1,
            CompressedFormat::Bc3 => PixelFormat::Bc3,
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        match self {
            CompressedFormat::Bc1 => 1,
            CompressedFormat::Bc3 => 3,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(CompressedFormat::Bc1),
            3 => Some(CompressedFormat::Bc3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedImage {
    pub width: u32,
    pub height: u32,
    pub format: CompressedFormat,
    pub data: Vec<u8>,
}

/// Decoding, minification and derived-level caching for one kind of source.
pub trait ImageSource: Send + Sync + 'static {
    /// Reads only the header.
    fn ping(&self, path: &Path) -> Result<ImageHeader, MipmapError>;

    /// Decodes the full-resolution image.
    fn read(&self, path: &Path) -> Result<DynamicImage, MipmapError>;

    fn minify(&self, image: &DynamicImage, size: MipSize) -> DynamicImage;

    /// Returns `Ok(None)` when no cache file exists.
    fn read_cache(&self, path: &Path) -> Result<Option<DynamicImage>, MipmapError>;

    fn write_cache(&self, image: &DynamicImage, path: &Path) -> Result<(), MipmapError>;

    /// File suffix used for derived-level cache files.
    fn cache_suffix(&self) -> &'static str {
        "png"
    }
}

/// [`ImageSource`] over files the `image` crate can decode. Derived levels are cached as PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageSource {
    pub filter: MinifyFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinifyFilter {
    Nearest,
    #[default]
    Triangle,
    Lanczos3,
}

impl From<MinifyFilter> for FilterType {
    fn from(filter: MinifyFilter) -> Self {
        match filter {
            MinifyFilter::Nearest => FilterType::Nearest,
            MinifyFilter::Triangle => FilterType::Triangle,
            MinifyFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl ImageSource for FileImageSource {
    fn ping(&self, path: &Path) -> Result<ImageHeader, MipmapError> {
        let decoder = ImageReader::open(path)
            .map_err(|error| MipmapError::io(path, error))?
            .with_guessed_format()
            .map_err(|error| MipmapError::io(path, error))?
            .into_decoder()
            .map_err(|error| MipmapError::decode(path, error))?;
        let (width, height) = decoder.dimensions();
        if width == 0 || height == 0 {
            return Err(MipmapError::UnsupportedImage {
                path: path.to_path_buf(),
                reason: format!("empty image {width}x{height}"),
            });
        }
        Ok(ImageHeader {
            size: MipSize::new(width, height),
            pixel_format: decoder.color_type().into(),
        })
    }

    fn read(&self, path: &Path) -> Result<DynamicImage, MipmapError> {
        ImageReader::open(path)
            .map_err(|error| MipmapError::io(path, error))?
            .with_guessed_format()
            .map_err(|error| MipmapError::io(path, error))?
            .decode()
            .map_err(|error| MipmapError::decode(path, error))
    }

    fn minify(&self, image: &DynamicImage, size: MipSize) -> DynamicImage {
        image.resize_exact(size.width, size.height, self.filter.into())
    }

    fn read_cache(&self, path: &Path) -> Result<Option<DynamicImage>, MipmapError> {
        if !path.is_file() {
            return Ok(None);
        }
        self.read(path).map(Some)
    }

    fn write_cache(&self, image: &DynamicImage, path: &Path) -> Result<(), MipmapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| MipmapError::io(parent, error))?;
        }
        // PNG has no float formats.
        let converted;
        let image = match image.color() {
            ColorType::Rgb32F | ColorType::Rgba32F => {
                converted = DynamicImage::ImageRgba16(image.to_rgba16());
                &converted
            }
            _ => image,
        };
        let partial = path.with_extension("partial");
        image
            .save_with_format(&partial, ImageFormat::Png)
            .map_err(|error| MipmapError::decode(&partial, error))?;
        fs::rename(&partial, path).map_err(|error| MipmapError::io(path, error))
    }
}

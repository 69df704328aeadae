//! Block-compressed level chains and their on-disk container.

use std::fs;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use image::DynamicImage;

use crate::error::MipmapError;
use crate::source::{CompressedFormat, CompressedImage};

const COMPRESSED_FILE_MAGIC: [u8; 4] = *b"MPBC";
const COMPRESSED_FILE_VERSION: u32 = 1;

/// Encodes decoded pixels into a GPU block format.
pub trait BlockCompressor: Send + Sync + 'static {
    fn format(&self) -> CompressedFormat;

    fn compress(&self, image: &DynamicImage) -> Result<Vec<u8>, MipmapError>;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CompressedFileHeader {
    magic: [u8; 4],
    version: u32,
    width: u32,
    height: u32,
    format: u32,
    payload_len: u32,
}

const HEADER_LEN: usize = std::mem::size_of::<CompressedFileHeader>();

pub(crate) fn write_compressed_file(
    path: &Path,
    image: &CompressedImage,
) -> Result<(), MipmapError> {
    let payload_len = u32::try_from(image.data.len()).map_err(|_| {
        MipmapError::Compression(format!("payload too large: {} bytes", image.data.len()))
    })?;
    let header = CompressedFileHeader {
        magic: COMPRESSED_FILE_MAGIC,
        version: COMPRESSED_FILE_VERSION,
        width: image.width,
        height: image.height,
        format: image.format.to_raw(),
        payload_len,
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + image.data.len());
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    bytes.extend_from_slice(&image.data);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| MipmapError::io(parent, error))?;
    }
    let partial = path.with_extension("partial");
    fs::write(&partial, &bytes).map_err(|error| MipmapError::io(&partial, error))?;
    fs::rename(&partial, path).map_err(|error| MipmapError::io(path, error))
}

pub(crate) fn read_compressed_file(path: &Path) -> Result<CompressedImage, MipmapError> {
    let bytes = fs::read(path).map_err(|error| MipmapError::io(path, error))?;
    let corrupt = |reason| MipmapError::CorruptCache {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    let header: CompressedFileHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
    if header.magic != COMPRESSED_FILE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if header.version != COMPRESSED_FILE_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let Some(format) = CompressedFormat::from_raw(header.format) else {
        return Err(corrupt("unknown block format"));
    };
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != header.payload_len as usize {
        return Err(corrupt("payload length mismatch"));
    }
    Ok(CompressedImage {
        width: header.width,
        height: header.height,
        format,
        data: payload.to_vec(),
    })
}

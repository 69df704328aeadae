mod compressed;
mod load;
mod ping;
mod release;

pub(crate) use compressed::{GenerateCompressedChainTask, LoadCompressedImageTask};
pub(crate) use load::LoadImageTask;
pub(crate) use ping::PingTask;
pub(crate) use release::MipmapReleaseTask;

pub(crate) const COMPRESSED_SUFFIX: &str = "bcn";

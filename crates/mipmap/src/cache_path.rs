use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(hash: u64, bytes: &[u8]) -> u64 {
    bytes.iter().fold(hash, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Identity of one version of a source file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFingerprint {
    pub path: PathBuf,
    pub file_size: u64,
    pub modified: Option<SystemTime>,
}

impl SourceFingerprint {
    pub fn hash(&self) -> u64 {
        let modified_nanos = self
            .modified
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_nanos());
        let hash = fnv1a64(FNV_OFFSET_BASIS, self.path.as_os_str().as_encoded_bytes());
        let hash = fnv1a64(hash, &self.file_size.to_le_bytes());
        fnv1a64(hash, &modified_nanos.to_le_bytes())
    }
}

/// Layout of derived-level files: `<root>/v<version>/<fingerprint>/level<n>.<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    root: PathBuf,
    version: u32,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>, version: u32) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source: &SourceFingerprint) -> PathBuf {
        self.root
            .join(format!("v{}", self.version))
            .join(format!("{:016x}", source.hash()))
    }

    pub fn level_path(&self, source: &SourceFingerprint, level: usize, suffix: &str) -> PathBuf {
        self.source_dir(source).join(format!("level{level}.{suffix}"))
    }
}

//! Backing storage for height/material blocks.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tessera_math::Aabb;

use crate::error::SourceError;
use crate::node::NodeKey;

/// What a loader job asks the source for.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockRequest {
    /// Grid address of the node.
    pub key: NodeKey,
    /// Node bounds at request time.
    pub bounds: Aabb,
    /// Samples per side minus one.
    pub resolution: u32,
}

impl BlockRequest {
    pub fn depth(&self) -> u8 {
        self.key.depth
    }
}

/// Produces the raw bytes of a node's block. Called from loader threads.
pub trait PatchSource: Send + Sync + 'static {
    fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>, SourceError>;
}

impl<F> PatchSource for F
where
    F: Fn(&BlockRequest) -> Result<Vec<u8>, SourceError> + Send + Sync + 'static,
{
    fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>, SourceError> {
        self(request)
    }
}

/// Reads pre-baked blocks from `<root>/<depth>/<x>_<y>.patch`.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the block for `key`.
    pub fn block_path(&self, key: NodeKey) -> PathBuf {
        self.root
            .join(key.depth.to_string())
            .join(format!("{}_{}.patch", key.x, key.y))
    }

    /// Write a block where [`DirectorySource::read_block`] will find it.
    pub fn write_block(&self, key: NodeKey, bytes: &[u8]) -> Result<(), SourceError> {
        let path = self.block_path(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl PatchSource for DirectorySource {
    fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>, SourceError> {
        match std::fs::read(self.block_path(request.key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SourceError::NotFound(request.key)),
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

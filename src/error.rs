use std::{error::Error, fmt};

/// Pipeline stage that failed to allocate its working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Heightfield,
    CompactHeightfield,
    Layers,
    Contours,
    PolyMesh,
    DetailMesh,
}

/// Hard limit hit while building a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    /// The polygon mesh of a layer would need ``0xffff`` vertices or more.
    Vertices,
    /// More regions than can be addressed (border regions use the high bit).
    Regions,
    /// More than 255 layers in a single tile.
    Layers,
    /// The tile grid has no free slots left.
    TilePool,
}

/// Reasons a single tile build can fail.
///
/// Failures are local to the tile, the previous data of the tile is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileBuildError {
    /// Allocation of the working memory for ``stage`` failed.
    ResourceExhaustion { stage: BuildStage },
    LimitExceeded(LimitExceeded),
    /// The build was superseded before its result was applied.
    Cancelled,
    /// A cached layer could not be decompressed.
    CorruptLayer(u8),
}

impl fmt::Display for TileBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileBuildError::ResourceExhaustion { stage } => {
                write!(f, "Out of memory while allocating {stage:?} data.")
            }
            TileBuildError::LimitExceeded(limit) => match limit {
                LimitExceeded::Vertices => write!(f, "Too many vertices in polygon mesh."),
                LimitExceeded::Regions => write!(f, "Too many regions in tile."),
                LimitExceeded::Layers => write!(f, "Too many layers in tile."),
                LimitExceeded::TilePool => write!(f, "Tile limit reached."),
            },
            TileBuildError::Cancelled => write!(f, "Tile build was cancelled."),
            TileBuildError::CorruptLayer(layer) => write!(f, "Cached layer {layer} is corrupt."),
        }
    }
}

impl Error for TileBuildError {}

impl From<LimitExceeded> for TileBuildError {
    fn from(value: LimitExceeded) -> Self {
        TileBuildError::LimitExceeded(value)
    }
}

/// Errors when decoding a serialized tile or cache layer.
#[derive(Debug)]
pub enum TileDataError {
    /// Data did not start with the expected magic number.
    InvalidMagic,
    /// Data was written by an incompatible version.
    UnsupportedVersion(u16),
    /// Data was truncated or otherwise malformed.
    Malformed(std::io::Error),
    Decompression(lz4_flex::block::DecompressError),
}

impl fmt::Display for TileDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileDataError::InvalidMagic => write!(f, "Invalid magic number."),
            TileDataError::UnsupportedVersion(version) => {
                write!(f, "Unsupported data version: {version}.")
            }
            TileDataError::Malformed(error) => write!(f, "Malformed data: {error}"),
            TileDataError::Decompression(error) => write!(f, "Failed to decompress: {error}"),
        }
    }
}

impl Error for TileDataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TileDataError::Malformed(error) => Some(error),
            TileDataError::Decompression(error) => Some(error),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TileDataError {
    fn from(value: std::io::Error) -> Self {
        TileDataError::Malformed(value)
    }
}

impl From<lz4_flex::block::DecompressError> for TileDataError {
    fn from(value: lz4_flex::block::DecompressError) -> Self {
        TileDataError::Decompression(value)
    }
}

/// Reserves space for ``additional`` elements, reporting failure as [`TileBuildError::ResourceExhaustion`].
pub(crate) fn try_reserve<T>(
    vec: &mut Vec<T>,
    additional: usize,
    stage: BuildStage,
) -> Result<(), TileBuildError> {
    vec.try_reserve(additional)
        .map_err(|_| TileBuildError::ResourceExhaustion { stage })
}

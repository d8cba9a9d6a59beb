//! Checkpoint header parsing and tensor layout.
//!
//! A checkpoint is a flat little-endian file: a fixed-width header describing
//! the hyperparameters, followed by the tensor payload in declaration order.
//! The loader turns the header into a [ModelConfig] and a region table that
//! the weight store serves windows from; nothing here touches tensor data.

use std::io::Read;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::util::read_i32;

/// Cookie checked at construction so that embedders built against a different
/// configuration layout fail fast instead of misbehaving.
pub const API_VERSION: u32 = 0x4c32_0101;

/// Magic leading a quantized checkpoint ("ak42").
pub(crate) const QUANT_MAGIC: u32 = u32::from_le_bytes(*b"ak42");

/// The only quantized format version understood by this crate.
pub(crate) const QUANT_VERSION: i32 = 2;

/// Byte length of the seven-field hyperparameter block.
const HYPERPARAMS_LEN: u64 = 7 * 4;

/// Hyperparameters of a llama2-family checkpoint, immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Feed-forward hidden dimension.
    pub hidden_dim: usize,
    /// Number of decoder layers.
    pub n_layers: usize,
    /// Number of attention query heads.
    pub n_heads: usize,
    /// Number of key/value heads; smaller than `n_heads` for grouped-query
    /// attention.
    pub n_kv_heads: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Maximum sequence length.
    pub seq_len: usize,
    /// Whether the output classifier reuses the token embedding.
    pub shared_classifier: bool,
    /// Per-group int8 quantization group size, if the file is quantized.
    pub group_size: Option<usize>,
}

impl ModelConfig {
    /// Dimension of one attention head.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of one key/value row across all KV heads.
    pub fn kv_dim(&self) -> usize {
        self.head_dim() * self.n_kv_heads
    }

    /// Number of f32 entries in one side (K or V) of a session's cache.
    pub fn kv_cache_floats(&self) -> usize {
        self.n_layers * self.seq_len * self.kv_dim()
    }
}

/// Errors arising while constructing a transformer.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The configuration was built against a different library revision.
    #[error("api version mismatch (expected {expected:#010x}, found {found:#010x})")]
    VersionMismatch {
        /// The version this crate was compiled with.
        expected: u32,
        /// The version found in the configuration.
        found: u32,
    },
    /// A file could not be opened.
    #[error("could not open {path:?}")]
    OpenFile {
        /// The original I/O error.
        #[source]
        source: std::io::Error,
        /// The path that could not be opened.
        path: PathBuf,
    },
    /// Reading model data failed.
    #[error("could not read model data")]
    Read(#[from] std::io::Error),
    /// The quantized magic was present but the version is not understood.
    #[error("unsupported quantized checkpoint version {version}")]
    UnsupportedFormatVersion {
        /// The version found in the file.
        version: i32,
    },
    /// A header field is non-positive or internally inconsistent.
    #[error("implausible hyperparameter {field} = {value}")]
    InvalidHyperparameters {
        /// Name of the offending field.
        field: &'static str,
        /// The value found in the header.
        value: i64,
    },
    /// The payload length disagrees with the shapes declared in the header.
    #[error("tensor payload is {actual} bytes, header declares {expected}")]
    TensorDataMismatch {
        /// Bytes the declared shapes require.
        expected: u64,
        /// Bytes actually present.
        actual: u64,
    },
    /// A vocabulary entry is malformed or extends past the end of the file.
    #[error("invalid vocabulary entry {index}")]
    InvalidVocabulary {
        /// Index of the offending entry.
        index: usize,
    },
    /// No checkpoint path was supplied for a file-backed access mode.
    #[error("no checkpoint path supplied")]
    MissingCheckpointPath,
    /// Preloaded model bytes must be 4-byte aligned for tensor views.
    #[error("preloaded model bytes are not 4-byte aligned")]
    UnalignedModelBytes,
    /// The paged cache was configured with a zero byte budget.
    #[error("paged cache budget must be non-zero")]
    ZeroCacheBudget,
    /// The paged cache budget cannot hold the largest tensor.
    #[error("paged cache budget of {budget} bytes cannot hold a {required} byte tensor")]
    CacheTooSmall {
        /// The configured budget.
        budget: usize,
        /// Bytes needed by the largest single tensor region.
        required: usize,
    },
    /// The math worker pool could not be started.
    #[error("could not start the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// A parsed checkpoint header.
#[derive(Debug, Clone)]
pub(crate) struct ParsedHeader {
    pub config: ModelConfig,
    /// Offset of the first tensor byte.
    pub data_offset: u64,
}

/// Parse the header at the start of a checkpoint.
///
/// Float checkpoints open directly with the seven i32 hyperparameters; a
/// quantized checkpoint prepends the magic, a version word, and appends the
/// group size. The sign of `vocab_size` carries the shared-classifier flag.
pub(crate) fn parse_header(reader: &mut impl Read) -> Result<ParsedHeader, LoadError> {
    let first = read_i32(reader)?;

    let (quantized, dim) = if first as u32 == QUANT_MAGIC {
        let version = read_i32(reader)?;
        if version != QUANT_VERSION {
            return Err(LoadError::UnsupportedFormatVersion { version });
        }
        (true, read_i32(reader)?)
    } else {
        (false, first)
    };

    let hidden_dim = read_i32(reader)?;
    let n_layers = read_i32(reader)?;
    let n_heads = read_i32(reader)?;
    let n_kv_heads = read_i32(reader)?;
    let vocab_field = read_i32(reader)?;
    let seq_len = read_i32(reader)?;

    let shared_classifier = vocab_field > 0;
    let vocab_size = vocab_field.unsigned_abs() as i32;

    let group_size = if quantized {
        Some(read_i32(reader)?)
    } else {
        None
    };

    let field = |name: &'static str, value: i32| -> Result<usize, LoadError> {
        if value <= 0 {
            return Err(LoadError::InvalidHyperparameters {
                field: name,
                value: value as i64,
            });
        }
        Ok(value as usize)
    };

    let config = ModelConfig {
        dim: field("dim", dim)?,
        hidden_dim: field("hidden_dim", hidden_dim)?,
        n_layers: field("n_layers", n_layers)?,
        n_heads: field("n_heads", n_heads)?,
        n_kv_heads: field("n_kv_heads", n_kv_heads)?,
        vocab_size: field("vocab_size", vocab_size)?,
        seq_len: field("seq_len", seq_len)?,
        shared_classifier,
        group_size: group_size.map(|gs| field("group_size", gs)).transpose()?,
    };

    if config.dim % config.n_heads != 0 {
        return Err(LoadError::InvalidHyperparameters {
            field: "n_heads",
            value: config.n_heads as i64,
        });
    }
    if config.n_heads % config.n_kv_heads != 0 {
        return Err(LoadError::InvalidHyperparameters {
            field: "n_kv_heads",
            value: config.n_kv_heads as i64,
        });
    }
    if let Some(gs) = config.group_size {
        if config.dim % gs != 0 || config.hidden_dim % gs != 0 {
            return Err(LoadError::InvalidHyperparameters {
                field: "group_size",
                value: gs as i64,
            });
        }
    }

    let data_offset = if quantized {
        // magic + version + hyperparameters + group size
        4 + 4 + HYPERPARAMS_LEN + 4
    } else {
        HYPERPARAMS_LEN
    };

    Ok(ParsedHeader {
        config,
        data_offset,
    })
}

/// Byte range of one tensor region within the checkpoint file.
///
/// For quantized 2-D tensors the region covers the per-group f32 scales
/// followed by the int8 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TensorRegion {
    /// Position in declaration order; the paged cache's LRU key.
    pub index: usize,
    /// Absolute file offset of the first byte.
    pub offset: u64,
    /// Length in bytes.
    pub len: usize,
}

/// Regions of one decoder layer, in declaration order.
#[derive(Debug, Clone)]
pub(crate) struct LayerRegions {
    pub rms_att: TensorRegion,
    pub wq: TensorRegion,
    pub wk: TensorRegion,
    pub wv: TensorRegion,
    pub wo: TensorRegion,
    pub rms_ffn: TensorRegion,
    pub w1: TensorRegion,
    pub w2: TensorRegion,
    pub w3: TensorRegion,
}

/// All tensor regions of a checkpoint, computed once from the header.
#[derive(Debug, Clone)]
pub(crate) struct TensorCatalog {
    pub token_embedding: TensorRegion,
    pub layers: Vec<LayerRegions>,
    pub rms_final: TensorRegion,
    /// Equal to `token_embedding` when the classifier is shared.
    pub classifier: TensorRegion,
    /// File offset one past the last tensor byte.
    pub end_offset: u64,
    /// Length of the largest single region, for cache budget validation.
    pub largest_region: usize,
}

impl TensorCatalog {
    pub fn build(config: &ModelConfig, data_offset: u64) -> Self {
        let mut cursor = data_offset;
        let mut index = 0;
        let mut largest = 0;

        // 1-D norm weights stay f32 even in quantized checkpoints.
        let norm_len = config.dim * 4;
        let weight_len = |numel: usize| match config.group_size {
            Some(gs) => numel / gs * 4 + numel,
            None => numel * 4,
        };

        let mut region = |len: usize| {
            let r = TensorRegion {
                index,
                offset: cursor,
                len,
            };
            index += 1;
            cursor += len as u64;
            largest = largest.max(len);
            r
        };

        let dim = config.dim;
        let hidden = config.hidden_dim;
        let kv_dim = config.kv_dim();

        let token_embedding = region(weight_len(config.vocab_size * dim));
        let layers = (0..config.n_layers)
            .map(|_| LayerRegions {
                rms_att: region(norm_len),
                wq: region(weight_len(dim * dim)),
                wk: region(weight_len(dim * kv_dim)),
                wv: region(weight_len(dim * kv_dim)),
                wo: region(weight_len(dim * dim)),
                rms_ffn: region(norm_len),
                w1: region(weight_len(dim * hidden)),
                w2: region(weight_len(hidden * dim)),
                w3: region(weight_len(dim * hidden)),
            })
            .collect();
        let rms_final = region(norm_len);
        let classifier = if config.shared_classifier {
            token_embedding
        } else {
            region(weight_len(config.vocab_size * dim))
        };

        TensorCatalog {
            token_embedding,
            layers,
            rms_final,
            classifier,
            end_offset: cursor,
            largest_region: largest,
        }
    }

    /// Check the declared layout against the real payload length.
    pub fn check_payload(&self, file_len: u64) -> Result<(), LoadError> {
        if file_len != self.end_offset {
            return Err(LoadError::TensorDataMismatch {
                expected: self.end_offset,
                actual: file_len,
            });
        }
        Ok(())
    }
}

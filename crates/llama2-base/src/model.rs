//! The transformer: construction, weight access, and the single-token
//! decoder forward pass.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::Arc;

use crate::loader::{parse_header, LoadError, ModelConfig, TensorCatalog, TensorRegion, API_VERSION};
use crate::ops;
use crate::storage::{TensorStorage, TensorWindow};
use crate::tokenizer::{TokenId, Tokenizer};

/// How the engine reaches the checkpoint payload.
#[derive(Clone)]
pub enum ModelAccess {
    /// Map the checkpoint file read-only (the default).
    Mmap,
    /// The checkpoint is already in caller memory; the engine borrows it for
    /// its lifetime and never frees it. The bytes must be 4-byte aligned.
    Preloaded {
        /// The complete checkpoint image, header included.
        bytes: Arc<[u8]>,
    },
    /// Fault tensor regions in from the file on demand, evicting
    /// least-recently-used regions to stay under the byte budget.
    Paged {
        /// Maximum resident bytes; must hold at least the largest tensor.
        cache_limit: usize,
    },
}

impl Default for ModelAccess {
    fn default() -> Self {
        ModelAccess::Mmap
    }
}

/// Whether queries are raw continuations or chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelType {
    /// Prompts are concatenated inline and continued.
    #[default]
    Gen,
    /// Prompts are wrapped in the llama2 `[INST]`/`<<SYS>>` chat template.
    Chat,
}

/// Parameters for transformer construction.
#[derive(Clone)]
pub struct ModelParameters {
    /// Must equal [API_VERSION]; `Default` fills it in.
    pub api_version: u32,
    /// Path to the checkpoint; required unless access is `Preloaded`.
    pub checkpoint_path: Option<PathBuf>,
    /// Path to the vocabulary file; `None` means `./tokenizer.bin`.
    pub tokenizer_path: Option<PathBuf>,
    /// Weight access mode.
    pub model_access: ModelAccess,
    /// Worker pool size for the matrix kernels; 0 selects the default of 8.
    pub threads: usize,
    /// Prompt handling style.
    pub model_type: ModelType,
    /// Maximum live sessions; 0 means unlimited.
    pub max_sessions: usize,
    /// Cosmetic identifier echoed by [Llama::describe].
    pub name: String,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            api_version: API_VERSION,
            checkpoint_path: None,
            tokenizer_path: None,
            model_access: ModelAccess::default(),
            threads: 0,
            model_type: ModelType::default(),
            max_sessions: 0,
            name: String::new(),
        }
    }
}

const DEFAULT_THREADS: usize = 8;
const DEFAULT_TOKENIZER_PATH: &str = "./tokenizer.bin";

/// Activation scratch for one decoder step. Owned by the transformer; the
/// scheduler serializes forward passes, so one set serves any number of
/// sessions.
struct Activations {
    x: Vec<f32>,
    xb: Vec<f32>,
    xb2: Vec<f32>,
    hb: Vec<f32>,
    hb2: Vec<f32>,
    q: Vec<f32>,
    att: Vec<f32>,
    logits: Vec<f32>,
    // int8 activation staging, zero-length for float checkpoints
    xq: Vec<i8>,
    xq_s: Vec<f32>,
    hq: Vec<i8>,
    hq_s: Vec<f32>,
}

impl Activations {
    fn new(config: &ModelConfig) -> Self {
        let quant_len = |n: usize| match config.group_size {
            Some(gs) => (n, n / gs),
            None => (0, 0),
        };
        let (xq_len, xq_groups) = quant_len(config.dim);
        let (hq_len, hq_groups) = quant_len(config.hidden_dim);
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.dim],
            att: vec![0.0; config.n_heads * config.seq_len],
            logits: vec![0.0; config.vocab_size],
            xq: vec![0; xq_len],
            xq_s: vec![0.0; xq_groups],
            hq: vec![0; hq_len],
            hq_s: vec![0.0; hq_groups],
        }
    }
}

/// Per-session key/value cache, written in place at the current position by
/// each forward pass.
pub(crate) struct KvCache {
    k: Vec<f32>,
    v: Vec<f32>,
    row: usize,
    rows_per_layer: usize,
}

impl KvCache {
    pub(crate) fn new(config: &ModelConfig) -> Self {
        let floats = config.kv_cache_floats();
        Self {
            k: vec![0.0; floats],
            v: vec![0.0; floats],
            row: config.kv_dim(),
            rows_per_layer: config.seq_len,
        }
    }

    fn rows_mut(&mut self, layer: usize, pos: usize) -> (&mut [f32], &mut [f32]) {
        let at = (layer * self.rows_per_layer + pos) * self.row;
        (
            &mut self.k[at..at + self.row],
            &mut self.v[at..at + self.row],
        )
    }

    fn layer(&self, layer: usize) -> (&[f32], &[f32]) {
        let at = layer * self.rows_per_layer * self.row;
        let len = self.rows_per_layer * self.row;
        (&self.k[at..at + len], &self.v[at..at + len])
    }
}

/// A llama2-family transformer bound to one checkpoint.
///
/// Weights and the vocabulary are read-only after construction and shared by
/// every session. The engine is single-threaded cooperative: the scheduler
/// runs at most one forward pass at a time, and the activation scratch lives
/// here rather than per session.
pub struct Llama {
    config: ModelConfig,
    tokenizer: Tokenizer,
    storage: TensorStorage,
    catalog: TensorCatalog,
    pool: rayon::ThreadPool,
    scratch: RefCell<Activations>,
    model_type: ModelType,
    max_sessions: usize,
    live_sessions: Cell<usize>,
    threads: usize,
    name: String,
}

impl Llama {
    /// Construct a transformer from `params`.
    ///
    /// On failure everything partially acquired is released before the error
    /// is returned.
    pub fn load(params: &ModelParameters) -> Result<Self, LoadError> {
        if params.api_version != API_VERSION {
            return Err(LoadError::VersionMismatch {
                expected: API_VERSION,
                found: params.api_version,
            });
        }

        let checkpoint_path = || {
            params
                .checkpoint_path
                .as_deref()
                .ok_or(LoadError::MissingCheckpointPath)
        };

        // Parse the header through whichever medium the access mode uses,
        // then let the catalog place every tensor.
        let (storage, payload_len, header) = match &params.model_access {
            ModelAccess::Mmap => {
                let (storage, len) = TensorStorage::map(checkpoint_path()?)?;
                let header = match &storage {
                    TensorStorage::Mapped(map) => parse_header(&mut &map[..])?,
                    _ => unreachable!(),
                };
                (storage, len, header)
            }
            ModelAccess::Preloaded { bytes } => {
                let header = parse_header(&mut &bytes[..])?;
                let (storage, len) = TensorStorage::preload(bytes.clone())?;
                (storage, len, header)
            }
            ModelAccess::Paged { cache_limit } => {
                let path = checkpoint_path()?;
                let mut file = std::fs::File::open(path).map_err(|source| LoadError::OpenFile {
                    source,
                    path: path.to_owned(),
                })?;
                let header = parse_header(&mut file)?;
                let catalog = TensorCatalog::build(&header.config, header.data_offset);
                drop(file);
                let (storage, len) =
                    TensorStorage::paged(path, *cache_limit, catalog.largest_region)?;
                (storage, len, header)
            }
        };

        let config = header.config;
        let catalog = TensorCatalog::build(&config, header.data_offset);
        catalog.check_payload(payload_len)?;

        let tokenizer_path = params
            .tokenizer_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKENIZER_PATH));
        let tokenizer = Tokenizer::from_file(&tokenizer_path, config.vocab_size)?;

        let threads = if params.threads == 0 {
            DEFAULT_THREADS
        } else {
            params.threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?;

        let scratch = RefCell::new(Activations::new(&config));

        log::debug!(
            "loaded {} checkpoint: dim={} layers={} heads={}/{} vocab={} seq_len={}",
            if config.group_size.is_some() {
                "int8"
            } else {
                "f32"
            },
            config.dim,
            config.n_layers,
            config.n_heads,
            config.n_kv_heads,
            config.vocab_size,
            config.seq_len,
        );

        Ok(Self {
            config,
            tokenizer,
            storage,
            catalog,
            pool,
            scratch,
            model_type: params.model_type,
            max_sessions: params.max_sessions,
            live_sessions: Cell::new(0),
            threads,
            name: params.name.clone(),
        })
    }

    /// The checkpoint hyperparameters.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The tokenizer loaded alongside the checkpoint.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Prompt handling style configured at construction.
    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Number of currently live sessions bound to this transformer.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.get()
    }

    /// A human-readable summary of the model and its configuration.
    pub fn describe(&self) -> String {
        let c = &self.config;
        format!(
            "{}: {} llama2 model, dim {} (hidden {}), {} layers, {} heads ({} kv), \
             vocab {}, seq_len {}, {} access, {} threads",
            if self.name.is_empty() {
                "unnamed"
            } else {
                &self.name
            },
            match c.group_size {
                Some(gs) => format!("int8 (group {gs})"),
                None => "f32".to_owned(),
            },
            c.dim,
            c.hidden_dim,
            c.n_layers,
            c.n_heads,
            c.n_kv_heads,
            c.vocab_size,
            c.seq_len,
            self.storage.mode_label(),
            self.threads,
        )
    }

    /// Claim a session slot, enforcing `max_sessions`.
    pub(crate) fn acquire_session_slot(&self) -> bool {
        if self.max_sessions != 0 && self.live_sessions.get() >= self.max_sessions {
            return false;
        }
        self.live_sessions.set(self.live_sessions.get() + 1);
        true
    }

    pub(crate) fn release_session_slot(&self) {
        self.live_sessions.set(self.live_sessions.get() - 1);
    }

    /// One decoder step: consume `token` at `pos`, leaving the logits in the
    /// transformer scratch for [Llama::sample_logits].
    pub(crate) fn forward(
        &self,
        token: TokenId,
        pos: usize,
        kv: &mut KvCache,
    ) -> Result<(), LoadError> {
        let c = &self.config;
        debug_assert!(pos < c.seq_len);
        debug_assert!((token as usize) < c.vocab_size);

        let dim = c.dim;
        let hidden_dim = c.hidden_dim;
        let kv_dim = c.kv_dim();
        let head_dim = c.head_dim();
        let heads_per_kv = c.n_heads / c.n_kv_heads;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let gs = c.group_size;

        let mut scratch = self.scratch.borrow_mut();
        let s = &mut *scratch;

        // Token embedding.
        let embedding = self.storage.window(self.catalog.token_embedding)?;
        self.embed_row(&embedding, token as usize, &mut s.x);

        for l in 0..c.n_layers {
            let regions = &self.catalog.layers[l];

            // Attention block.
            let rms_att = self.storage.window(regions.rms_att)?;
            ops::rms_norm(&mut s.xb, &s.x, rms_att.floats());

            if let Some(gs) = gs {
                ops::quantize(&mut s.xq, &mut s.xq_s, &s.xb, gs);
            }
            {
                let (k_row, v_row) = kv.rows_mut(l, pos);
                self.linear(&mut s.q, &s.xb, (&s.xq, &s.xq_s), regions.wq, dim)?;
                self.linear(k_row, &s.xb, (&s.xq, &s.xq_s), regions.wk, dim)?;
                self.linear(v_row, &s.xb, (&s.xq, &s.xq_s), regions.wv, dim)?;
                ops::rope(&mut s.q, k_row, pos, head_dim, kv_dim);
            }

            // Multi-head attention over the cache, one head per work item.
            let (k_layer, v_layer) = kv.layer(l);
            let q = &s.q;
            let att = &mut s.att;
            let xb = &mut s.xb;
            self.pool.install(|| {
                use rayon::prelude::*;
                xb.par_chunks_mut(head_dim)
                    .zip(att.par_chunks_mut(c.seq_len))
                    .enumerate()
                    .for_each(|(h, (xb_h, att_h))| {
                        let q_h = &q[h * head_dim..(h + 1) * head_dim];
                        let kv_h = h / heads_per_kv;
                        let att_h = &mut att_h[..=pos];
                        for (t, a) in att_h.iter_mut().enumerate() {
                            let k_t = &k_layer[t * kv_dim + kv_h * head_dim..][..head_dim];
                            *a = q_h.iter().zip(k_t).map(|(&x, &y)| x * y).sum::<f32>() * scale;
                        }
                        ops::softmax(att_h);
                        xb_h.fill(0.0);
                        for (t, &a) in att_h.iter().enumerate() {
                            let v_t = &v_layer[t * kv_dim + kv_h * head_dim..][..head_dim];
                            for (o, &v) in xb_h.iter_mut().zip(v_t) {
                                *o += a * v;
                            }
                        }
                    });
            });

            // Attention output projection and residual.
            if let Some(gs) = gs {
                ops::quantize(&mut s.xq, &mut s.xq_s, &s.xb, gs);
            }
            self.linear(&mut s.xb2, &s.xb, (&s.xq, &s.xq_s), regions.wo, dim)?;
            ops::accum(&mut s.x, &s.xb2);

            // Feed-forward block.
            let rms_ffn = self.storage.window(regions.rms_ffn)?;
            ops::rms_norm(&mut s.xb, &s.x, rms_ffn.floats());
            if let Some(gs) = gs {
                ops::quantize(&mut s.xq, &mut s.xq_s, &s.xb, gs);
            }
            self.linear(&mut s.hb, &s.xb, (&s.xq, &s.xq_s), regions.w1, dim)?;
            self.linear(&mut s.hb2, &s.xb, (&s.xq, &s.xq_s), regions.w3, dim)?;
            ops::swiglu(&mut s.hb, &s.hb2);
            if let Some(gs) = gs {
                ops::quantize(&mut s.hq, &mut s.hq_s, &s.hb, gs);
            }
            self.linear(&mut s.xb, &s.hb, (&s.hq, &s.hq_s), regions.w2, hidden_dim)?;
            ops::accum(&mut s.x, &s.xb);
        }

        // Final norm and classifier.
        let rms_final = self.storage.window(self.catalog.rms_final)?;
        ops::rms_norm(&mut s.xb, &s.x, rms_final.floats());
        if let Some(gs) = gs {
            ops::quantize(&mut s.xq, &mut s.xq_s, &s.xb, gs);
        }
        self.linear(
            &mut s.logits,
            &s.xb,
            (&s.xq, &s.xq_s),
            self.catalog.classifier,
            dim,
        )?;

        Ok(())
    }

    /// Select the next token from the logits left behind by [Llama::forward].
    pub(crate) fn sample_logits(&self, sampler: &mut crate::samplers::Sampler) -> TokenId {
        let mut scratch = self.scratch.borrow_mut();
        sampler.sample(&mut scratch.logits)
    }

    /// Copy (dequantizing if needed) one embedding row into `out`.
    fn embed_row(&self, embedding: &TensorWindow, row: usize, out: &mut [f32]) {
        let dim = self.config.dim;
        match self.config.group_size {
            None => out.copy_from_slice(&embedding.floats()[row * dim..(row + 1) * dim]),
            Some(gs) => {
                let groups = self.config.vocab_size * dim / gs;
                let (scales, quants) = embedding.scales_and_quants(groups);
                for (j, o) in out.iter_mut().enumerate() {
                    let at = row * dim + j;
                    *o = quants[at] as f32 * scales[at / gs];
                }
            }
        }
    }

    /// Matrix-vector product through either the float or the int8 kernel.
    /// `x_q8` carries the pre-quantized activation for quantized checkpoints
    /// and stays empty for float ones.
    fn linear(
        &self,
        out: &mut [f32],
        x: &[f32],
        x_q8: (&[i8], &[f32]),
        region: TensorRegion,
        in_dim: usize,
    ) -> Result<(), LoadError> {
        let window = self.storage.window(region)?;
        match self.config.group_size {
            None => ops::matmul(&self.pool, out, x, window.floats()),
            Some(gs) => {
                let groups = out.len() * in_dim / gs;
                let (ws, wq) = window.scales_and_quants(groups);
                ops::matmul_q8(&self.pool, out, x_q8.0, x_q8.1, wq, ws, in_dim, gs);
            }
        }
        Ok(())
    }
}

//! Synthetic checkpoints and vocabularies for the integration tests.
//!
//! The model is tiny but structurally complete: grouped-query attention,
//! both float and int8 payloads, and a vocabulary with the full byte-fallback
//! range plus a handful of single-character tokens so prompts tokenize
//! predictably.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use byteorder::{LittleEndian, WriteBytesExt};
use llama2::{InferenceFeedback, ModelParameters};

pub const DIM: usize = 8;
pub const HIDDEN_DIM: usize = 16;
pub const N_LAYERS: usize = 2;
pub const N_HEADS: usize = 2;
pub const N_KV_HEADS: usize = 1;
pub const SEQ_LEN: usize = 16;
pub const GROUP_SIZE: usize = 8;

/// Control tokens + 256 byte fallbacks + the extra surfaces below.
pub const VOCAB_SIZE: usize = 259 + EXTRA_PIECES.len();

const EXTRA_PIECES: [&str; 5] = [" ", "a", "b", "c", "d"];

const KV_DIM: usize = DIM / N_HEADS * N_KV_HEADS;

/// Deterministic filler for weight element `i`, small enough that the
/// forward pass stays well-behaved.
fn weight(i: usize) -> f32 {
    ((i * 37 + 11) % 97) as f32 / 97.0 - 0.5
}

enum Tensor {
    /// Always stored as f32 (the norm weights).
    Norm(usize),
    /// Quantized in int8 checkpoints.
    Weight(usize),
}

/// Tensor declaration order, shared by the float and int8 writers.
fn layout(shared_classifier: bool) -> Vec<Tensor> {
    let mut tensors = vec![Tensor::Weight(VOCAB_SIZE * DIM)];
    for _ in 0..N_LAYERS {
        tensors.push(Tensor::Norm(DIM));
        tensors.push(Tensor::Weight(DIM * DIM));
        tensors.push(Tensor::Weight(DIM * KV_DIM));
        tensors.push(Tensor::Weight(DIM * KV_DIM));
        tensors.push(Tensor::Weight(DIM * DIM));
        tensors.push(Tensor::Norm(DIM));
        tensors.push(Tensor::Weight(DIM * HIDDEN_DIM));
        tensors.push(Tensor::Weight(HIDDEN_DIM * DIM));
        tensors.push(Tensor::Weight(DIM * HIDDEN_DIM));
    }
    tensors.push(Tensor::Norm(DIM));
    if !shared_classifier {
        tensors.push(Tensor::Weight(VOCAB_SIZE * DIM));
    }
    tensors
}

fn write_hyperparams(out: &mut impl Write, shared_classifier: bool) {
    let vocab_field = if shared_classifier {
        VOCAB_SIZE as i32
    } else {
        -(VOCAB_SIZE as i32)
    };
    for v in [
        DIM as i32,
        HIDDEN_DIM as i32,
        N_LAYERS as i32,
        N_HEADS as i32,
        N_KV_HEADS as i32,
        vocab_field,
        SEQ_LEN as i32,
    ] {
        out.write_i32::<LittleEndian>(v).unwrap();
    }
}

/// Write a float32 checkpoint.
pub fn write_float_checkpoint(path: &Path, shared_classifier: bool) {
    let mut out = BufWriter::new(File::create(path).unwrap());
    write_hyperparams(&mut out, shared_classifier);
    let mut i = 0;
    for tensor in layout(shared_classifier) {
        let numel = match tensor {
            Tensor::Norm(n) | Tensor::Weight(n) => n,
        };
        for _ in 0..numel {
            out.write_f32::<LittleEndian>(weight(i)).unwrap();
            i += 1;
        }
    }
}

/// Write an int8 checkpoint with per-group scales preceding each weight.
pub fn write_quantized_checkpoint(path: &Path, shared_classifier: bool) {
    let mut out = BufWriter::new(File::create(path).unwrap());
    out.write_all(b"ak42").unwrap();
    out.write_i32::<LittleEndian>(2).unwrap();
    write_hyperparams(&mut out, shared_classifier);
    out.write_i32::<LittleEndian>(GROUP_SIZE as i32).unwrap();

    let mut i = 0;
    for tensor in layout(shared_classifier) {
        match tensor {
            Tensor::Norm(numel) => {
                for _ in 0..numel {
                    out.write_f32::<LittleEndian>(weight(i)).unwrap();
                    i += 1;
                }
            }
            Tensor::Weight(numel) => {
                let values: Vec<f32> = (0..numel)
                    .map(|_| {
                        let v = weight(i);
                        i += 1;
                        v
                    })
                    .collect();
                let mut quants = vec![0i8; numel];
                let mut scales = vec![0f32; numel / GROUP_SIZE];
                for (g, group) in values.chunks_exact(GROUP_SIZE).enumerate() {
                    let wmax = group.iter().fold(0f32, |a, &b| a.max(b.abs()));
                    let scale = wmax / 127.0;
                    scales[g] = scale;
                    for (k, &v) in group.iter().enumerate() {
                        quants[g * GROUP_SIZE + k] = (v / scale).round() as i8;
                    }
                }
                for s in scales {
                    out.write_f32::<LittleEndian>(s).unwrap();
                }
                for q in quants {
                    out.write_i8(q).unwrap();
                }
            }
        }
    }
}

/// Write a vocabulary with the control tokens, the `<0xNN>` byte range, and
/// the extra single-character surfaces.
pub fn write_vocab(path: &Path) {
    let mut out = BufWriter::new(File::create(path).unwrap());
    out.write_i32::<LittleEndian>(6).unwrap();

    let mut entry = |score: f32, piece: &[u8]| {
        out.write_f32::<LittleEndian>(score).unwrap();
        out.write_i32::<LittleEndian>(piece.len() as i32).unwrap();
        out.write_all(piece).unwrap();
    };

    entry(0.0, b"<unk>");
    entry(0.0, b"<s>");
    entry(0.0, b"</s>");
    for b in 0u16..=255 {
        entry(0.0, format!("<0x{b:02X}>").as_bytes());
    }
    for piece in EXTRA_PIECES {
        entry(0.0, piece.as_bytes());
    }
}

/// A tiny model on disk: checkpoint plus matching vocabulary.
pub struct TinyModel {
    _dir: tempfile::TempDir,
    pub checkpoint: PathBuf,
    pub tokenizer: PathBuf,
}

impl TinyModel {
    pub fn float() -> Self {
        Self::build(|path| write_float_checkpoint(path, true))
    }

    pub fn float_split_classifier() -> Self {
        Self::build(|path| write_float_checkpoint(path, false))
    }

    pub fn quantized() -> Self {
        Self::build(|path| write_quantized_checkpoint(path, true))
    }

    fn build(write_checkpoint: impl FnOnce(&Path)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("model.bin");
        let tokenizer = dir.path().join("tokenizer.bin");
        write_checkpoint(&checkpoint);
        write_vocab(&tokenizer);
        Self {
            _dir: dir,
            checkpoint,
            tokenizer,
        }
    }

    /// Construction parameters pointing at this model, mmap access.
    pub fn params(&self) -> ModelParameters {
        ModelParameters {
            checkpoint_path: Some(self.checkpoint.clone()),
            tokenizer_path: Some(self.tokenizer.clone()),
            threads: 2,
            name: "tiny".into(),
            ..Default::default()
        }
    }
}

/// A piece callback that appends into a shared string.
pub fn gather() -> (Rc<RefCell<String>>, impl FnMut(&str) -> InferenceFeedback) {
    let buffer = Rc::new(RefCell::new(String::new()));
    let sink = buffer.clone();
    let callback = move |piece: &str| {
        sink.borrow_mut().push_str(piece);
        InferenceFeedback::Continue
    };
    (buffer, callback)
}

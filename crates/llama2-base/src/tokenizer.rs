//! Byte-pair tokenizer.
//!
//! The vocabulary file stores `vocab_size` scored surfaces; encoding walks
//! UTF-8 characters, falls back to `<0xNN>` byte tokens for anything outside
//! the vocabulary, and then greedily merges adjacent pairs by score.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::loader::LoadError;
use crate::util::{read_bytes_with_len, read_f32, read_i32};

/// Identifier of one vocabulary entry.
pub type TokenId = u32;

/// Fixed beginning-of-sequence token.
pub const TOKEN_BOS: TokenId = 1;
/// Fixed end-of-sequence token.
pub const TOKEN_EOS: TokenId = 2;

/// First of the 256 byte-fallback ids (`<0x00>`..`<0xFF>`).
const BYTE_FALLBACK_BASE: u32 = 3;

/// The vocabulary: surfaces and merge scores indexed by id, with a reverse
/// index from surface bytes to id.
pub struct Tokenizer {
    pieces: Vec<Vec<u8>>,
    scores: Vec<f32>,
    lookup: HashMap<Vec<u8>, TokenId>,
    max_piece_len: usize,
}

impl Tokenizer {
    /// Load a vocabulary of `vocab_size` entries from `path`.
    pub fn from_file(path: &Path, vocab_size: usize) -> Result<Self, LoadError> {
        let file = File::open(path).map_err(|source| LoadError::OpenFile {
            source,
            path: path.to_owned(),
        })?;
        let mut reader = BufReader::new(file);

        let max_piece_len = read_i32(&mut reader)? as usize;

        let mut pieces = Vec::with_capacity(vocab_size);
        let mut scores = Vec::with_capacity(vocab_size);
        let mut lookup = HashMap::with_capacity(vocab_size);
        for index in 0..vocab_size {
            let score = read_f32(&mut reader).map_err(|_| LoadError::InvalidVocabulary { index })?;
            let len = read_i32(&mut reader).map_err(|_| LoadError::InvalidVocabulary { index })?;
            if len < 0 {
                return Err(LoadError::InvalidVocabulary { index });
            }
            let piece = read_bytes_with_len(&mut reader, len as usize)
                .map_err(|_| LoadError::InvalidVocabulary { index })?;

            // First occurrence wins so duplicate surfaces resolve to the
            // lowest id.
            lookup.entry(piece.clone()).or_insert(index as TokenId);
            pieces.push(piece);
            scores.push(score);
        }

        Ok(Self {
            pieces,
            scores,
            lookup,
            max_piece_len,
        })
    }

    /// Number of vocabulary entries.
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Whether the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Longest surface in the vocabulary, as recorded in the file header.
    pub fn max_piece_len(&self) -> usize {
        self.max_piece_len
    }

    /// The surface bytes of one token.
    pub fn piece(&self, token: TokenId) -> &[u8] {
        &self.pieces[token as usize]
    }

    /// Encode `text` into token ids, optionally prefixed with BOS.
    ///
    /// Non-empty text gets the llama2 dummy-prefix space token before its
    /// first character; characters missing from the vocabulary decompose into
    /// byte-fallback ids.
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(TOKEN_BOS);
        }

        if !text.is_empty() {
            if let Some(&space) = self.lookup.get(b" ".as_slice()) {
                tokens.push(space);
            }
        }

        let mut buf = [0u8; 4];
        for ch in text.chars() {
            let bytes = ch.encode_utf8(&mut buf).as_bytes();
            match self.lookup.get(bytes) {
                Some(&id) => tokens.push(id),
                None => {
                    for &b in bytes {
                        tokens.push(b as u32 + BYTE_FALLBACK_BASE);
                    }
                }
            }
        }

        self.merge(&mut tokens);
        tokens
    }

    /// Greedily merge adjacent pairs, best score first; equal scores resolve
    /// to the lowest merged id.
    fn merge(&self, tokens: &mut Vec<TokenId>) {
        loop {
            let mut best: Option<(f32, TokenId, usize)> = None;
            let mut cat = Vec::with_capacity(self.max_piece_len.max(8));

            for i in 0..tokens.len().saturating_sub(1) {
                cat.clear();
                cat.extend_from_slice(self.piece(tokens[i]));
                cat.extend_from_slice(self.piece(tokens[i + 1]));
                if let Some(&id) = self.lookup.get(&cat) {
                    let score = self.scores[id as usize];
                    let better = match best {
                        None => true,
                        Some((bs, bid, _)) => score > bs || (score == bs && id < bid),
                    };
                    if better {
                        best = Some((score, id, i));
                    }
                }
            }

            match best {
                Some((_, id, at)) => {
                    tokens[at] = id;
                    tokens.remove(at + 1);
                }
                None => return,
            }
        }
    }

    /// Decode one emitted token to surface bytes.
    ///
    /// A leading space is stripped directly after BOS, and `<0xNN>` fallback
    /// surfaces yield the raw byte.
    pub fn decode(&self, prev: TokenId, token: TokenId) -> Vec<u8> {
        let mut piece = self.piece(token);
        if prev == TOKEN_BOS && piece.first() == Some(&b' ') {
            piece = &piece[1..];
        }
        if let Some(byte) = parse_byte_fallback(piece) {
            return vec![byte];
        }
        piece.to_vec()
    }
}

/// `<0xNN>` surfaces stand in for the raw byte `NN`.
fn parse_byte_fallback(piece: &[u8]) -> Option<u8> {
    if piece.len() != 6 || !piece.starts_with(b"<0x") || piece[5] != b'>' {
        return None;
    }
    let hex = std::str::from_utf8(&piece[3..5]).ok()?;
    u8::from_str_radix(hex, 16).ok()
}

/// Wrap a prompt in the llama2 chat instruction template, with the optional
/// system block inside the instruction.
pub(crate) fn render_chat(system: Option<&str>, prompt: &str) -> String {
    match system {
        Some(system) => format!("[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{prompt} [/INST]"),
        None => format!("[INST] {prompt} [/INST]"),
    }
}

//! This crate provides the implementation for the `llama2` crate: loading
//! llama2-family checkpoints behind substitutable weight storage, the
//! byte-pair tokenizer, the decoder forward pass with its worker pool, and
//! cooperative round-robin scheduling of concurrent inference sessions.
//!
//! It is not intended for use by end-users; depend on `llama2` instead.

mod inference_session;
mod loader;
mod model;
mod ops;
mod samplers;
mod scheduler;
mod storage;
mod tokenizer;
pub mod util;

pub use inference_session::{
    stderr_issue, InferenceError, InferenceFeedback, InferenceRequest, InferenceSession,
    InferenceStats, IssueCallback, SessionState,
};
pub use loader::{LoadError, ModelConfig, API_VERSION};
pub use model::{Llama, ModelAccess, ModelParameters, ModelType};
pub use samplers::{InferenceParameters, Sampler, XorShiftRng};
pub use scheduler::SessionScheduler;
pub use tokenizer::{TokenId, Tokenizer, TOKEN_BOS, TOKEN_EOS};
pub use util::TokenUtf8Buffer;

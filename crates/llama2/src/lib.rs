//! This crate runs text completion over llama2-family checkpoints, sharing
//! one set of read-only model weights between any number of concurrent
//! inference sessions. Sessions are stepped cooperatively, one token each in
//! round-robin, so an embedder can interleave many generations on a single
//! thread and stream every piece through a callback as it is produced.
//!
//! The checkpoint can be memory-mapped, handed over as bytes already in
//! memory, or paged in on demand under a byte budget; float32 and per-group
//! int8 checkpoints are supported.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use llama2::{
//!     InferenceFeedback, InferenceRequest, InferenceSession, Llama, ModelParameters,
//!     SessionScheduler,
//! };
//!
//! let model = Arc::new(
//!     Llama::load(&ModelParameters {
//!         checkpoint_path: Some("stories110M.bin".into()),
//!         ..Default::default()
//!     })
//!     .unwrap_or_else(|err| panic!("failed to load model: {err}")),
//! );
//!
//! let scheduler = SessionScheduler::new();
//! let session = InferenceSession::new(model).unwrap();
//!
//! scheduler
//!     .query(
//!         &session,
//!         InferenceRequest {
//!             prompt: "Once upon a time ".into(),
//!             maximum_token_count: Some(64),
//!             ..Default::default()
//!         },
//!         |piece| {
//!             print!("{piece}");
//!             InferenceFeedback::Continue
//!         },
//!     )
//!     .unwrap();
//!
//! while scheduler.step_next() {}
//! ```
#![deny(missing_docs)]

pub use llama2_base::{
    stderr_issue, InferenceError, InferenceFeedback, InferenceParameters, InferenceRequest,
    InferenceSession, InferenceStats, IssueCallback, Llama, LoadError, ModelAccess, ModelConfig,
    ModelParameters, ModelType, Sampler, SessionScheduler, SessionState, TokenId, TokenUtf8Buffer,
    Tokenizer, XorShiftRng, API_VERSION, TOKEN_BOS, TOKEN_EOS,
};

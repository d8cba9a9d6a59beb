//! Per-query inference sessions.
//!
//! A session owns everything one in-flight query needs: the key/value cache,
//! the position, the remaining prompt tokens, sampling state, and the piece
//! callback. Stepping is driven by the scheduler; all the per-token logic
//! lives here.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

use crate::model::{KvCache, Llama, ModelType};
use crate::samplers::{InferenceParameters, Sampler};
use crate::tokenizer::{render_chat, TokenId, TOKEN_EOS};
use crate::util::TokenUtf8Buffer;

/// Errors encountered while creating or driving a session.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The transformer's session cap has been reached.
    #[error("the transformer's session limit has been reached")]
    SessionLimit,
    /// The session was cancelled; a cancelled session cannot be re-queried
    /// and should be dropped.
    #[error("the session was cancelled and is awaiting teardown")]
    SessionConsumed,
}

/// Feedback from the piece callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceFeedback {
    /// Keep generating.
    Continue,
    /// Cancel this session; no further pieces will be delivered.
    Halt,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Constructed, no query started yet.
    Queued,
    /// In the scheduler's active list.
    Running,
    /// Marked for teardown; swept on its next scheduler visit.
    Cancelled,
    /// Ran to completion (EOS, token limit, or sequence end).
    Finished,
}

/// Counters for one query, reset by each [SessionScheduler::query][q].
///
/// [q]: crate::SessionScheduler::query
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InferenceStats {
    /// Prompt tokens fed through the model (the BOS token included).
    pub prompt_tokens: usize,
    /// Tokens sampled after the prompt was consumed.
    pub predict_tokens: usize,
    /// Engine time spent inside forward passes and sampling.
    pub compute_duration: Duration,
}

impl Display for InferenceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prompt_tokens: {}, predict_tokens: {}, compute: {}ms",
            self.prompt_tokens,
            self.predict_tokens,
            self.compute_duration.as_millis()
        )
    }
}

/// A query's piece callback.
pub type IssueCallback = Box<dyn FnMut(&str) -> InferenceFeedback>;

/// The default piece callback: write to stderr and keep going.
pub fn stderr_issue() -> impl FnMut(&str) -> InferenceFeedback {
    |piece| {
        eprint!("{piece}");
        InferenceFeedback::Continue
    }
}

/// One query against a session.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    /// The user prompt.
    pub prompt: String,
    /// Optional system prompt; wrapped by the chat template for chat models,
    /// prepended inline otherwise.
    pub system: Option<String>,
    /// Cap on emitted tokens; `None` (or zero) means the model maximum.
    pub maximum_token_count: Option<usize>,
    /// Sampling parameters; zero fields select defaults.
    pub parameters: InferenceParameters,
}

/// What the scheduler should do with a session after one step.
pub(crate) enum StepOutcome {
    /// Keep the session in the rotation.
    Continue,
    /// Remove the session from the rotation.
    Deregister,
}

pub(crate) struct SessionCore {
    model: Arc<Llama>,
    registered: Cell<bool>,
    inner: RefCell<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    /// Next sequence position to be filled by a forward pass.
    pos: usize,
    /// The token the next forward pass consumes.
    current: TokenId,
    /// Remaining prompt tokens after `current`.
    queue: VecDeque<TokenId>,
    /// Emitted tokens for this query (prompt echo included).
    emitted: usize,
    /// Emission cap for this query.
    limit: usize,
    kv: KvCache,
    sampler: Sampler,
    callback: Option<IssueCallback>,
    utf8: TokenUtf8Buffer,
    stats: InferenceStats,
}

impl SessionCore {
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.get()
    }

    pub(crate) fn set_registered(&self, value: bool) {
        self.registered.set(value);
    }

    pub(crate) fn mark_cancelled(&self) {
        let mut inner = self.inner.borrow_mut();
        match inner.state {
            SessionState::Queued | SessionState::Running => {
                inner.state = SessionState::Cancelled;
            }
            // Cancelling a finished or already-cancelled session is a no-op.
            SessionState::Cancelled | SessionState::Finished => {}
        }
    }

    /// Prepare the session for a fresh prompt.
    pub(crate) fn reset_for_query(
        &self,
        request: InferenceRequest,
        callback: IssueCallback,
    ) -> Result<(), InferenceError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == SessionState::Cancelled {
            return Err(InferenceError::SessionConsumed);
        }

        let text = match self.model.model_type() {
            ModelType::Chat => render_chat(request.system.as_deref(), &request.prompt),
            ModelType::Gen => match &request.system {
                Some(system) => format!("{system}{}", request.prompt),
                None => request.prompt.clone(),
            },
        };

        let mut tokens: VecDeque<TokenId> =
            self.model.tokenizer().encode(&text, true).into();
        // The encoder always yields at least BOS.
        let current = tokens.pop_front().expect("encode always yields BOS");

        let seq_len = self.model.config().seq_len;
        let limit = match request.maximum_token_count {
            None | Some(0) => seq_len,
            Some(n) => n.min(seq_len),
        };

        let params = request.parameters;
        let temperature = if params.temperature == 0.0 {
            InferenceParameters::DEFAULT_TEMPERATURE
        } else {
            params.temperature
        };
        let top_p = if params.top_p == 0.0 {
            InferenceParameters::DEFAULT_TOP_P
        } else {
            params.top_p
        };
        let seed = if params.rng_seed == 0 {
            wall_clock_seed()
        } else {
            params.rng_seed
        };

        inner.state = SessionState::Running;
        inner.pos = 0;
        inner.current = current;
        inner.queue = tokens;
        inner.emitted = 0;
        inner.limit = limit;
        inner.sampler = Sampler::new(temperature, top_p, seed);
        inner.callback = Some(callback);
        inner.utf8 = TokenUtf8Buffer::new();
        inner.stats = InferenceStats {
            prompt_tokens: inner.queue.len() + 1,
            ..InferenceStats::default()
        };

        log::debug!(
            "query: {} prompt tokens, limit {limit}, temperature {temperature}, top_p {top_p}",
            inner.queue.len() + 1,
        );

        Ok(())
    }

    /// Produce one token for this session and report whether it should stay
    /// in the rotation.
    pub(crate) fn step(&self) -> StepOutcome {
        let mut inner = self.inner.borrow_mut();
        match inner.state {
            SessionState::Cancelled | SessionState::Finished => return StepOutcome::Deregister,
            SessionState::Queued => {
                // Never queried; nothing to do and nothing to deliver.
                return StepOutcome::Deregister;
            }
            SessionState::Running => {}
        }

        let input = inner.current;
        let pos = inner.pos;
        let started = Instant::now();

        let inner_ref = &mut *inner;
        if let Err(err) = self.model.forward(input, pos, &mut inner_ref.kv) {
            log::error!("forward pass failed, finishing session: {err}");
            inner_ref.state = SessionState::Finished;
            return StepOutcome::Deregister;
        }

        // While prompt tokens remain, the sampled output is discarded and the
        // next prompt token is the one emitted; afterwards the sampler picks.
        let from_prompt = !inner_ref.queue.is_empty();
        let emitted = match inner_ref.queue.pop_front() {
            Some(next) => next,
            None => self.model.sample_logits(&mut inner_ref.sampler),
        };

        inner_ref.pos += 1;
        if !from_prompt {
            inner_ref.stats.predict_tokens += 1;
        }
        inner_ref.stats.compute_duration += started.elapsed();

        if !from_prompt && emitted == TOKEN_EOS {
            inner_ref.state = SessionState::Finished;
            return StepOutcome::Deregister;
        }

        let bytes = self.model.tokenizer().decode(input, emitted);
        inner_ref.current = emitted;
        inner_ref.emitted += 1;
        let piece = inner_ref.utf8.push(&bytes);

        // Invoke the callback outside the state borrow so that it can cancel
        // this (or any other) session.
        let mut callback = inner_ref.callback.take();
        drop(inner);

        let mut feedback = InferenceFeedback::Continue;
        if let (Some(cb), Some(piece)) = (callback.as_mut(), piece) {
            if !piece.is_empty() {
                feedback = cb(&piece);
            }
        }

        let mut inner = self.inner.borrow_mut();
        if inner.callback.is_none() {
            inner.callback = callback;
        }
        if feedback == InferenceFeedback::Halt {
            inner.state = SessionState::Cancelled;
        }
        match inner.state {
            SessionState::Cancelled => StepOutcome::Deregister,
            _ if inner.emitted >= inner.limit || inner.pos >= self.model.config().seq_len => {
                inner.state = SessionState::Finished;
                StepOutcome::Deregister
            }
            _ => StepOutcome::Continue,
        }
    }
}

fn wall_clock_seed() -> u64 {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    if seed == 0 {
        0x5eed
    } else {
        seed
    }
}

/// A live query session bound to one transformer.
///
/// The transformer must outlive its sessions, which the shared [Arc] handle
/// enforces. Dropping the session releases its slot, removes it from the
/// scheduler on its next visit, and runs the teardown observer.
pub struct InferenceSession {
    core: Arc<SessionCore>,
    teardown: Option<Box<dyn FnOnce()>>,
}

impl InferenceSession {
    /// Create a session. Fails with [InferenceError::SessionLimit] once the
    /// transformer's `max_sessions` cap is reached.
    pub fn new(model: Arc<Llama>) -> Result<Self, InferenceError> {
        if !model.acquire_session_slot() {
            return Err(InferenceError::SessionLimit);
        }
        let kv = KvCache::new(model.config());
        let core = SessionCore {
            model,
            registered: Cell::new(false),
            inner: RefCell::new(SessionInner {
                state: SessionState::Queued,
                pos: 0,
                current: 0,
                queue: VecDeque::new(),
                emitted: 0,
                limit: 0,
                kv,
                sampler: Sampler::new(1.0, 0.9, 1),
                callback: None,
                utf8: TokenUtf8Buffer::new(),
                stats: InferenceStats::default(),
            }),
        };
        Ok(Self {
            core: Arc::new(core),
            teardown: None,
        })
    }

    /// Register an observer invoked once when the session is torn down.
    pub fn on_teardown(&mut self, observer: impl FnOnce() + 'static) {
        self.teardown = Some(Box::new(observer));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.inner.borrow().state
    }

    /// Next sequence position (number of forward passes run this query).
    pub fn pos(&self) -> usize {
        self.core.inner.borrow().pos
    }

    /// Counters for the current query.
    pub fn stats(&self) -> InferenceStats {
        self.core.inner.borrow().stats
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.core.model.release_session_slot();
        if let Some(observer) = self.teardown.take() {
            observer();
        }
    }
}

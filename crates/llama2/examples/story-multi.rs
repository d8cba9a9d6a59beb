//! Run several generation sessions concurrently against one model, stepping
//! them round-robin and printing each session's output once all are done.
//!
//! Usage: `cargo run --example story-multi -- <checkpoint> [tokenizer]`
//! with e.g. the `stories110M.bin` checkpoint and its `tokenizer.bin`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use llama2::{
    InferenceFeedback, InferenceParameters, InferenceRequest, InferenceSession, Llama,
    ModelParameters, SessionScheduler,
};

const PROMPTS: [&str; 2] = ["My cat ", "When life gives you lemons "];

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let checkpoint = args.next().unwrap_or_else(|| {
        eprintln!("usage: story-multi <checkpoint> [tokenizer]");
        std::process::exit(1);
    });
    let tokenizer = args.next();

    let model = Arc::new(
        Llama::load(&ModelParameters {
            checkpoint_path: Some(checkpoint.into()),
            tokenizer_path: tokenizer.map(Into::into),
            name: "story-multi".into(),
            ..Default::default()
        })
        .unwrap_or_else(|err| panic!("failed to load model: {err}")),
    );
    println!("{}", model.describe());

    let scheduler = SessionScheduler::new();
    let mut sessions = Vec::new();
    let mut outputs = Vec::new();

    for prompt in PROMPTS {
        let session = InferenceSession::new(model.clone()).expect("session construction");
        let output = Rc::new(RefCell::new(String::new()));
        let sink = output.clone();
        scheduler
            .query(
                &session,
                InferenceRequest {
                    prompt: prompt.into(),
                    maximum_token_count: Some(64),
                    parameters: InferenceParameters {
                        temperature: 1.0,
                        top_p: 0.9,
                        rng_seed: 0x1234,
                    },
                    ..Default::default()
                },
                move |piece| {
                    sink.borrow_mut().push_str(piece);
                    InferenceFeedback::Continue
                },
            )
            .expect("query");
        sessions.push(session);
        outputs.push(output);
    }

    // One token per session per call, round-robin, until every session is
    // done.
    while scheduler.step_next() {}

    for (session, output) in sessions.iter().zip(&outputs) {
        println!("--- {}", session.stats());
        println!("{}", output.borrow());
    }
}

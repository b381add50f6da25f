//! End-to-end scheduler tests over a scripted backend and the byte codec.
//!
//! The backend emits a fixed token script per slot, records every evaluated
//! position, and can be told to fail, so the tests can observe exactly what
//! the scheduler fed it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slotserve::backend::{BackendError, ComputeBackend};
use slotserve::batch::BatchView;
use slotserve::config::EngineConfig;
use slotserve::server::Server;
use slotserve::task::{
    GenerationParams, InferenceKind, InferenceTask, ResultPayload, StopKind,
};
use slotserve::tokenizer::{ByteCodec, TextCodec};
use slotserve::{TaskId, Token};

#[derive(Clone, Copy)]
enum FailPlan {
    TooLargeOnce,
    FatalOnce,
}

#[derive(Default)]
struct Shared {
    /// Every text position fed to the backend: (seq, pos, token).
    evaluated: Vec<(usize, usize, Token)>,
    n_evaluate_calls: usize,
    fail_plan: Option<FailPlan>,
    delay: Option<Duration>,
}

/// Backend that answers every logits request with the next token of a
/// per-sequence script, then end-of-sequence once the script runs dry.
struct ScriptBackend {
    n_vocab: usize,
    scripts: Vec<Vec<Token>>,
    cyclic: bool,
    counters: Vec<usize>,
    rows: Vec<Vec<(Token, usize)>>,
    last_logits: Vec<(usize, Vec<f32>)>,
    last_pooled: Vec<Option<Vec<f32>>>,
    shared: Arc<Mutex<Shared>>,
}

impl ScriptBackend {
    fn new(n_seqs: usize, scripts: Vec<Vec<Token>>, cyclic: bool) -> (Self, Arc<Mutex<Shared>>) {
        assert_eq!(scripts.len(), n_seqs);
        let shared = Arc::new(Mutex::new(Shared::default()));
        let backend = Self {
            n_vocab: ByteCodec::VOCAB,
            scripts,
            cyclic,
            counters: vec![0; n_seqs],
            rows: vec![Vec::new(); n_seqs],
            last_logits: Vec::new(),
            last_pooled: vec![None; n_seqs],
            shared: shared.clone(),
        };
        (backend, shared)
    }

    /// Same script on every slot.
    fn uniform(n_seqs: usize, script: &[u8], cyclic: bool) -> (Self, Arc<Mutex<Shared>>) {
        let script: Vec<Token> = script.iter().map(|&b| Token::from(b)).collect();
        Self::new(n_seqs, vec![script; n_seqs], cyclic)
    }

    fn next_scripted(&mut self, seq: usize) -> Token {
        let script = &self.scripts[seq];
        let i = self.counters[seq];
        self.counters[seq] += 1;
        if self.cyclic {
            script[i % script.len()]
        } else if i < script.len() {
            script[i]
        } else {
            ByteCodec::EOS
        }
    }
}

impl ComputeBackend for ScriptBackend {
    fn n_vocab(&self) -> usize {
        self.n_vocab
    }

    fn n_embd(&self) -> usize {
        4
    }

    fn eos_token(&self) -> Token {
        ByteCodec::EOS
    }

    fn evaluate(&mut self, batch: BatchView<'_>) -> Result<(), BackendError> {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.n_evaluate_calls += 1;
            if let Some(delay) = shared.delay {
                std::thread::sleep(delay);
            }
            match shared.fail_plan.take() {
                Some(FailPlan::TooLargeOnce) => return Err(BackendError::BatchTooLarge(batch.len())),
                Some(FailPlan::FatalOnce) => {
                    return Err(BackendError::Fatal("injected failure".into()))
                }
                None => {}
            }
            for i in 0..batch.len() {
                shared
                    .evaluated
                    .push((batch.seq_id[i], batch.pos[i], batch.tokens[i]));
            }
        }

        self.last_logits.clear();
        for i in 0..batch.len() {
            let seq = batch.seq_id[i];
            self.rows[seq].push((batch.tokens[i], batch.pos[i]));
            if batch.logits[i] {
                let tok = self.next_scripted(seq);
                let mut logits = vec![0.0f32; self.n_vocab];
                logits[tok as usize] = 10.0;
                self.last_logits.push((i, logits));
            }
            let pooled = vec![self.rows[seq].len() as f32; 4];
            self.last_pooled[seq] = Some(pooled);
        }
        Ok(())
    }

    fn evaluate_chunk(
        &mut self,
        seq_id: usize,
        fingerprint: u64,
        pos: usize,
        n_tokens: usize,
    ) -> Result<(), BackendError> {
        for i in 0..n_tokens {
            self.rows[seq_id].push((fingerprint as Token, pos + i));
        }
        Ok(())
    }

    fn logits(&self, idx: usize) -> &[f32] {
        &self
            .last_logits
            .iter()
            .find(|(i, _)| *i == idx)
            .expect("logits requested for unmarked batch index")
            .1
    }

    fn embedding(&self, seq_id: usize) -> Option<Vec<f32>> {
        self.last_pooled[seq_id].clone()
    }

    fn cache_clear_all(&mut self) {
        for rows in &mut self.rows {
            rows.clear();
        }
    }

    fn cache_clear(&mut self, seq_id: usize) {
        self.rows[seq_id].clear();
    }

    fn cache_remove_range(&mut self, seq_id: usize, from: usize) -> bool {
        self.rows[seq_id].retain(|&(_, pos)| pos < from);
        true
    }

    fn cache_copy(&mut self, src: usize, dst: usize, len: usize) {
        let copied: Vec<_> = self.rows[src]
            .iter()
            .filter(|&&(_, pos)| pos < len)
            .copied()
            .collect();
        self.rows[dst] = copied;
    }

    fn cache_shift(&mut self, seq_id: usize, p0: usize, p1: usize, delta: i64) {
        for row in &mut self.rows[seq_id] {
            if row.1 >= p0 && row.1 < p1 {
                row.1 = (row.1 as i64 + delta) as usize;
            }
        }
    }

    fn cache_divide(&mut self, seq_id: usize, p0: usize, p1: usize, divisor: usize) {
        for row in &mut self.rows[seq_id] {
            if row.1 >= p0 && row.1 < p1 {
                row.1 /= divisor;
            }
        }
    }
}

fn init_logging() {
    slotserve::logging::init_stderr("info");
}

fn small_config(n_slots: usize) -> EngineConfig {
    EngineConfig {
        n_ctx: 256 * n_slots,
        n_slots,
        n_batch: 64,
        n_ubatch: 64,
        ..Default::default()
    }
}

fn start_server(config: EngineConfig, backend: ScriptBackend) -> Server {
    init_logging();
    Server::start(config, Box::new(backend), Arc::new(ByteCodec)).unwrap()
}

fn tokens_of(text: &str) -> Vec<Token> {
    ByteCodec.encode(text).unwrap()
}

fn completion(prompt: &str, params: GenerationParams) -> InferenceTask {
    InferenceTask::completion(tokens_of(prompt).into(), params)
}

fn final_of(server: &Server, id: TaskId) -> slotserve::task::CompletionFinal {
    match server.recv_final(id).unwrap().payload {
        ResultPayload::CompletionFinal(f) => f,
        other => panic!("expected completion final, got {:?}", other),
    }
}

#[test]
fn test_every_task_gets_exactly_one_terminal() {
    let (backend, _) = ScriptBackend::uniform(4, b"ok", false);
    let server = Arc::new(start_server(small_config(4), backend));

    let mut handles = Vec::new();
    for t in 0..4 {
        let server = server.clone();
        handles.push(std::thread::spawn(move || {
            let mut finals = 0;
            for i in 0..5 {
                let id = server.submit(completion(
                    &format!("prompt-{}-{}", t, i),
                    GenerationParams {
                        n_predict: 4,
                        ..Default::default()
                    },
                ));
                let result = server.recv_final(id).unwrap();
                assert_eq!(result.task_id, id);
                assert!(result.is_terminal());
                finals += 1;
            }
            finals
        }));
    }

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 20);
}

#[test]
fn test_prefix_reuse_only_feeds_divergent_suffix() {
    let (backend, shared) = ScriptBackend::uniform(1, b"x", true);
    let server = start_server(small_config(1), backend);
    let params = GenerationParams {
        n_predict: 2,
        ..Default::default()
    };

    let id = server.submit(completion("abcd", params.clone()));
    let first = final_of(&server, id);
    assert_eq!(first.content, "xx");
    shared.lock().unwrap().evaluated.clear();

    // cached [a b c d x]; new prompt diverges at position 3
    let id = server.submit(completion("abce", params));
    let second = final_of(&server, id);
    assert_eq!(second.content, "xx");

    let evaluated = shared.lock().unwrap().evaluated.clone();
    assert!(
        evaluated.iter().all(|&(_, pos, _)| pos >= 3),
        "positions below the common prefix were re-fed: {:?}",
        evaluated
    );
    assert_eq!(evaluated[0], (0, 3, Token::from(b'e')));
}

#[test]
fn test_fully_cached_prompt_reevaluates_last_position() {
    let (backend, shared) = ScriptBackend::uniform(1, b"x", true);
    let server = start_server(small_config(1), backend);
    let params = GenerationParams {
        n_predict: 1,
        ..Default::default()
    };

    let id = server.submit(completion("abcd", params.clone()));
    final_of(&server, id);
    shared.lock().unwrap().evaluated.clear();

    // identical prompt: everything is cached, but the last position must be
    // re-fed to obtain logits
    let id = server.submit(completion("abcd", params));
    final_of(&server, id);

    let evaluated = shared.lock().unwrap().evaluated.clone();
    assert_eq!(evaluated, vec![(0, 3, Token::from(b'd'))]);
}

#[test]
fn test_truncation_keeps_head_and_tail() {
    let (backend, shared) = ScriptBackend::uniform(1, b"x", true);
    let config = EngineConfig {
        n_ctx: 16,
        n_slots: 1,
        n_batch: 64,
        n_ubatch: 64,
        ..Default::default()
    };
    let server = start_server(config, backend);

    // 24 tokens into a 16-token slot with n_keep = 2
    let prompt = "0123456789abcdefghijklmn";
    let id = server.submit(completion(
        prompt,
        GenerationParams {
            n_keep: 2,
            ..Default::default()
        },
    ));
    let fin = final_of(&server, id);

    assert!(fin.truncated);
    assert_eq!(fin.stop, StopKind::Limit);
    assert_eq!(fin.n_prompt_tokens, 16);

    let expected: Vec<Token> = tokens_of("01")
        .into_iter()
        .chain(tokens_of("abcdefghijklmn"))
        .collect();
    let evaluated = shared.lock().unwrap().evaluated.clone();
    let prompt_feed: Vec<Token> = evaluated
        .iter()
        .take(16)
        .map(|&(_, _, tok)| tok)
        .collect();
    assert_eq!(prompt_feed, expected);
}

#[test]
fn test_stop_string_spanning_tokens_is_excluded() {
    let (backend, _) = ScriptBackend::uniform(1, b"hello</s>world", false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion(
        "q",
        GenerationParams {
            stream: true,
            stop: vec!["</s>".into()],
            ..Default::default()
        },
    ));

    let mut partials = String::new();
    let fin = loop {
        let result = server.recv(id).unwrap();
        match result.payload {
            ResultPayload::CompletionPartial(p) => partials.push_str(&p.content),
            ResultPayload::CompletionFinal(f) => break f,
            other => panic!("unexpected payload {:?}", other),
        }
    };

    assert_eq!(fin.content, "hello");
    assert_eq!(fin.stop, StopKind::Word);
    assert_eq!(fin.stopping_word, "</s>");
    assert_eq!(partials, "hello");
}

#[test]
fn test_split_utf8_is_withheld_until_complete() {
    // "é" spans two byte tokens; no partial may carry half of it
    let script = "é!".as_bytes();
    let (backend, _) = ScriptBackend::uniform(1, script, false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion(
        "q",
        GenerationParams {
            stream: true,
            ..Default::default()
        },
    ));

    let mut partials = Vec::new();
    let fin = loop {
        let result = server.recv(id).unwrap();
        match result.payload {
            ResultPayload::CompletionPartial(p) => partials.push(p.content),
            ResultPayload::CompletionFinal(f) => break f,
            other => panic!("unexpected payload {:?}", other),
        }
    };

    assert_eq!(fin.content, "é!");
    for p in &partials {
        assert!(
            !p.contains('\u{FFFD}'),
            "partial contains a broken character: {:?}",
            p
        );
    }
    assert_eq!(partials.concat(), "é!");
    // nothing was flushed while the character was incomplete
    assert_eq!(partials.first().map(String::as_str), Some("é"));
}

#[test]
fn test_multitask_merges_in_submission_order() {
    // slot 0 finishes last, slot 2 first
    let scripts = vec![
        b"AAAAA".to_vec().into_iter().map(Token::from).collect(),
        b"BBB".to_vec().into_iter().map(Token::from).collect(),
        b"C".to_vec().into_iter().map(Token::from).collect(),
    ];
    let (backend, _) = ScriptBackend::new(3, scripts, false);
    let server = start_server(small_config(3), backend);

    let id = server.submit_many(
        InferenceKind::Completion,
        vec![tokens_of("p0"), tokens_of("p1"), tokens_of("p2")],
        GenerationParams::default(),
    );
    let result = server.recv_final(id).unwrap();

    let ResultPayload::Batch(items) = result.payload else {
        panic!("expected merged batch");
    };
    let contents: Vec<String> = items
        .iter()
        .map(|item| match item {
            ResultPayload::CompletionFinal(f) => f.content.clone(),
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();
    assert_eq!(contents, vec!["AAAAA", "BBB", "C"]);
    for (i, item) in items.iter().enumerate() {
        let ResultPayload::CompletionFinal(f) = item else {
            unreachable!()
        };
        assert_eq!(f.index, i);
    }
}

#[test]
fn test_deferred_task_runs_after_slot_frees() {
    let (backend, _) = ScriptBackend::uniform(1, b"zz", true);
    let server = start_server(small_config(1), backend);
    let params = GenerationParams {
        n_predict: 2,
        ..Default::default()
    };

    // both tasks race for the single slot; the loser is deferred
    let a = server.submit(completion("first", params.clone()));
    let b = server.submit(completion("second", params));

    let fa = final_of(&server, a);
    let fb = final_of(&server, b);
    assert_eq!(fa.content, "zz");
    assert_eq!(fb.content, "zz");
}

#[test]
fn test_cancel_releases_slot_and_stops_results() {
    let (backend, shared) = ScriptBackend::uniform(1, b"spin", true);
    shared.lock().unwrap().delay = Some(Duration::from_millis(1));
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion(
        "q",
        GenerationParams {
            stream: true,
            ..Default::default()
        },
    ));

    // wait for generation to be visibly underway
    let first = server.recv(id).unwrap();
    assert!(!first.is_terminal());

    server.cancel(id);

    // the slot must return to idle without a terminal result
    let mut idle = false;
    for _ in 0..100 {
        let report = server.poll_metrics(false).unwrap();
        if report.n_processing_slots == 0 {
            idle = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(idle, "slot did not become idle after cancel");

    // the scheduler keeps serving new work
    let id = server.submit(completion(
        "again",
        GenerationParams {
            n_predict: 2,
            ..Default::default()
        },
    ));
    let fin = final_of(&server, id);
    assert_eq!(fin.n_decoded, 2);
}

#[test]
fn test_backend_soft_failure_is_invisible_to_caller() {
    let (backend, shared) = ScriptBackend::uniform(1, b"ok", false);
    shared.lock().unwrap().fail_plan = Some(FailPlan::TooLargeOnce);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion("hello", GenerationParams::default()));
    let fin = final_of(&server, id);
    assert_eq!(fin.content, "ok");

    // the failed call plus at least one retry
    assert!(shared.lock().unwrap().n_evaluate_calls >= 2);
}

#[test]
fn test_backend_fatal_failure_fails_task_not_scheduler() {
    let (backend, shared) = ScriptBackend::uniform(1, b"ok", false);
    shared.lock().unwrap().fail_plan = Some(FailPlan::FatalOnce);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion("doomed", GenerationParams::default()));
    let result = server.recv_final(id).unwrap();
    assert!(result.is_error());

    // scheduling thread survives and serves the next task
    let id = server.submit(completion("fine", GenerationParams::default()));
    let fin = final_of(&server, id);
    assert_eq!(fin.content, "ok");
}

#[test]
fn test_malformed_params_rejected_before_slot_assignment() {
    let (backend, shared) = ScriptBackend::uniform(1, b"ok", false);
    let server = start_server(small_config(1), backend);

    let mut params = GenerationParams::default();
    params.sampling.top_p = 0.0;
    let id = server.submit(completion("bad", params));
    let result = server.recv_final(id).unwrap();
    match result.payload {
        ResultPayload::Error(e) => {
            assert_eq!(e.kind, slotserve::task::ErrorKind::InvalidRequest)
        }
        other => panic!("expected error, got {:?}", other),
    }
    // nothing was evaluated for the rejected task
    assert_eq!(shared.lock().unwrap().n_evaluate_calls, 0);

    // the slot stayed assignable
    let id = server.submit(completion("good", GenerationParams::default()));
    assert_eq!(final_of(&server, id).content, "ok");
}

#[test]
fn test_empty_prompt_resolves_immediately() {
    let (backend, _) = ScriptBackend::uniform(1, b"ok", false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion("", GenerationParams::default()));
    let fin = final_of(&server, id);
    assert!(fin.content.is_empty());
    assert_eq!(fin.n_decoded, 0);
}

#[test]
fn test_context_exhaustion_is_a_normal_terminal() {
    let (backend, _) = ScriptBackend::uniform(1, b"spin", true);
    let config = EngineConfig {
        n_ctx: 8,
        n_slots: 1,
        n_batch: 64,
        n_ubatch: 64,
        ..Default::default()
    };
    let server = start_server(config, backend);

    // unlimited budget: generation must be stopped by the context limit,
    // with the release happening at a tick boundary once one position is left
    let id = server.submit(completion("abcd", GenerationParams::default()));
    let fin = final_of(&server, id);
    assert_eq!(fin.stop, StopKind::Limit);
    assert!(fin.truncated);
    assert_eq!(fin.n_decoded, 4);
}

#[test]
fn test_embedding_short_circuits_without_sampling() {
    let (backend, shared) = ScriptBackend::uniform(1, b"never", false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(InferenceTask::embedding(tokens_of("embed me").into()));
    let result = server.recv_final(id).unwrap();
    match result.payload {
        ResultPayload::Embedding(e) => {
            assert_eq!(e.embedding.len(), 4);
            assert_eq!(e.n_tokens, 8);
        }
        other => panic!("expected embedding, got {:?}", other),
    }
    // no token was ever sampled from the script
    let evaluated = shared.lock().unwrap().evaluated.clone();
    assert!(evaluated.iter().all(|&(_, _, tok)| tok != Token::from(b'n')));
}

#[test]
fn test_rerank_batch_scores() {
    let (backend, _) = ScriptBackend::uniform(2, b"never", false);
    let server = start_server(small_config(2), backend);

    let id = server.submit_many(
        InferenceKind::Rerank,
        vec![tokens_of("q doc-one"), tokens_of("q longer document")],
        GenerationParams::default(),
    );
    let result = server.recv_final(id).unwrap();
    let ResultPayload::Batch(items) = result.payload else {
        panic!("expected batch");
    };
    assert_eq!(items.len(), 2);
    for (i, item) in items.iter().enumerate() {
        match item {
            ResultPayload::Rerank(r) => {
                assert_eq!(r.index, i);
                assert!(r.score > 0.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}

#[test]
fn test_system_prompt_seeds_every_slot() {
    let (backend, shared) = ScriptBackend::uniform(2, b"x", true);
    let server = start_server(small_config(2), backend);

    let n = server.set_system_prompt(tokens_of("SYS:")).unwrap();
    assert_eq!(n, 4);
    shared.lock().unwrap().evaluated.clear();

    // a prompt sharing the seeded prefix only evaluates its suffix
    let id = server.submit(completion(
        "SYS:hello",
        GenerationParams {
            n_predict: 1,
            ..Default::default()
        },
    ));
    final_of(&server, id);

    let evaluated = shared.lock().unwrap().evaluated.clone();
    assert!(
        evaluated.iter().all(|&(_, pos, _)| pos >= 4),
        "shared prefix was re-evaluated: {:?}",
        evaluated
    );
}

#[test]
fn test_metrics_report_counts_work() {
    let (backend, _) = ScriptBackend::uniform(1, b"ok", false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion("hello", GenerationParams::default()));
    final_of(&server, id);

    let report = server.poll_metrics(true).unwrap();
    assert_eq!(report.n_processing_slots, 0);
    assert_eq!(report.n_idle_slots, 1);
    assert!(report.n_decode_total > 0);
    assert_eq!(report.n_prompt_tokens_processed_total, 5);
    assert!(report.n_tokens_predicted_total >= 2);

    // the bucket was reset, totals survive
    let report = server.poll_metrics(false).unwrap();
    assert_eq!(report.n_prompt_tokens_processed, 0);
    assert_eq!(report.n_prompt_tokens_processed_total, 5);
}

#[test]
fn test_streaming_and_blocking_agree() {
    // two scripted runs of the same text, each ended by an explicit EOS
    let mut script: Vec<Token> = b"stream me".iter().map(|&b| Token::from(b)).collect();
    script.push(ByteCodec::EOS);
    let script: Vec<Token> = script.iter().chain(script.iter()).copied().collect();
    let (backend, _) = ScriptBackend::new(1, vec![script], false);
    let server = start_server(small_config(1), backend);

    let id = server.submit(completion("q", GenerationParams::default()));
    let blocking = final_of(&server, id);

    let id = server.submit(completion(
        "q",
        GenerationParams {
            stream: true,
            ..Default::default()
        },
    ));
    let mut streamed = String::new();
    let fin = loop {
        let result = server.recv(id).unwrap();
        match result.payload {
            ResultPayload::CompletionPartial(p) => streamed.push_str(&p.content),
            ResultPayload::CompletionFinal(f) => break f,
            other => panic!("unexpected payload {:?}", other),
        }
    };

    assert_eq!(blocking.content, fin.content);
    assert_eq!(streamed, fin.content);
    assert_eq!(fin.stop, StopKind::Eos);
}

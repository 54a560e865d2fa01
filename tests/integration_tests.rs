use async_trait::async_trait;
use extraction_prompt_optimizer::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Reply = std::result::Result<String, BackendError>;

const GOOD: &str = "Look in the header block and the remittance section for the issuing company. The vendor may be labelled \"Vendor\", \"Supplier\", \"Seller\", \"Remit To\", \"Payee\" or \"From\". Return the exact legal name as written on the invoice, including suffixes such as Ltd or Inc. Do not return the customer named under Bill To, and ignore logistics carriers. If no vendor is named anywhere, return \"Not Present\".";

// Seven quoted labels and a date format, around 400 characters.
const ISSUE_DATE: &str = "Look in the first page header and the opening paragraph of the invoice for the date it was issued. The value may be labelled \"Invoice Date\", \"Date of Issue\", \"Issue Date\", \"Billing Date\", \"Dated\", \"Tax Point Date\" or \"Document Date\". Return the date in YYYY-MM-DD format. Do not return the due date, the delivery date or the payment terms date. If no issue date appears anywhere, return \"Not Present\".";

// Has location, format and disambiguation but no synonyms or not-found handling.
const WEAK: &str = "Look in the header block and the remittance section for the company that issued the invoice and sent it to us for payment. Return the exact legal name as written on the invoice, including suffixes such as Ltd or Inc, and keep the punctuation of the original. Do not return the customer named under the billing heading, and ignore logistics carriers, banks and freight forwarders that appear elsewhere on the page.";

/// In-memory backend: diagnostic calls get a fixed theory, generation and
/// repair calls consume the scripted replies in order.
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    call_times: Mutex<Vec<Instant>>,
    delay: Option<Duration>,
    cancel_on_generation: Option<CancellationToken>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn with_replies(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn prompt_requests(&self) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.purpose != RequestPurpose::Diagnostic)
            .collect()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _token: &AccessToken,
    ) -> std::result::Result<String, BackendError> {
        self.requests.lock().unwrap().push(request.clone());
        self.call_times.lock().unwrap().push(Instant::now());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if request.purpose == RequestPurpose::Diagnostic {
            return Ok(r#"{"theory": "The instruction picked a bank name from the remittance block."}"#.to_string());
        }
        if let Some(token) = &self.cancel_on_generation {
            token.cancel();
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Network("script exhausted".to_string())))
    }
}

fn json_reply(instruction: &str) -> Reply {
    Ok(serde_json::json!({"newPrompt": instruction, "reasoning": "Covered the remittance block."}).to_string())
}

fn http_error(status: u16) -> Reply {
    Err(BackendError::Http {
        status,
        body: format!("status {}", status),
    })
}

fn vendor_field(key: &str) -> FieldSpec {
    FieldSpec::new(
        FieldDescriptor::new(key, "Vendor Name", FieldType::String),
        "Extract the vendor name.",
    )
}

fn failing_comparison(key: &str) -> FieldComparison {
    FieldComparison {
        field_key: key.to_string(),
        accuracy: 0.5,
        failures: vec![FailureExample {
            document_id: format!("{}-doc-1", key),
            predicted_value: "First National Bank".to_string(),
            expected_value: "Globex Ltd".to_string(),
        }],
        successes: vec![SuccessExample {
            document_id: format!("{}-doc-2", key),
            value: "Initech Inc".to_string(),
        }],
    }
}

fn run_request(keys: &[&str]) -> RunRequest {
    RunRequest {
        template_key: Some("invoices".to_string()),
        fields: keys.iter().map(|k| vendor_field(k)).collect(),
        comparison: Some(ComparisonResults::new(
            keys.iter().map(|k| failing_comparison(k)).collect(),
        )),
    }
}

fn fast_config() -> OptimizerConfig {
    OptimizerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..RetryPolicy::default()
        },
        ..OptimizerConfig::default()
    }
}

fn optimizer(
    backend: &Arc<ScriptedBackend>,
    config: OptimizerConfig,
) -> PromptOptimizer<Arc<ScriptedBackend>, StaticTokenProvider> {
    PromptOptimizer::new(backend.clone(), StaticTokenProvider::new("token"), config).unwrap()
}

#[tokio::test]
async fn test_generic_response_falls_back_to_template() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![Ok(
        "Extract the vendor name.".to_string(),
    )]));
    let run = optimizer(&backend, fast_config())
        .run(run_request(&["vendor"]))
        .await;

    assert_eq!(run.status, RunStatus::Review);
    let summary = &run.field_summaries[0];
    assert_eq!(summary.outcome, FieldOutcome::FallbackUsed);
    assert!(summary.rationale.as_deref().unwrap().starts_with("Used fallback template"));

    let validation = validate(summary.instruction.as_deref().unwrap());
    assert!(validation.is_valid);
    assert!(validation.missing.is_empty());
}

#[tokio::test]
async fn test_short_generated_instruction_reports_length() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![json_reply(
        "Extract the vendor name.",
    )]));
    let run = optimizer(&backend, fast_config())
        .run(run_request(&["vendor"]))
        .await;

    let summary = &run.field_summaries[0];
    assert_eq!(summary.outcome, FieldOutcome::FallbackUsed);
    assert_eq!(
        summary.rationale.as_deref(),
        Some("Used fallback template because generated instruction was 24 characters, needed 350+")
    );
}

#[tokio::test]
async fn test_fenced_valid_instruction_is_used_verbatim() {
    let validation = validate(ISSUE_DATE);
    assert!(validation.char_count >= 400, "length {}", validation.char_count);
    assert!(validation.synonym_count >= 7, "synonyms {}", validation.synonym_count);
    assert!(validation.is_valid);
    assert!(validation.defects.is_empty(), "{:?}", validation.defects);

    let fenced = format!(
        "```json\n{}\n```",
        serde_json::json!({"newPrompt": ISSUE_DATE, "reasoning": "Listed the date labels."})
    );
    let backend = Arc::new(ScriptedBackend::with_replies(vec![Ok(fenced)]));
    let request = RunRequest {
        template_key: Some("invoices".to_string()),
        fields: vec![FieldSpec::new(
            FieldDescriptor::new("invoice_date", "Invoice Date", FieldType::Date),
            "Extract the invoice date.",
        )],
        comparison: Some(ComparisonResults::new(vec![FieldComparison {
            field_key: "invoice_date".to_string(),
            accuracy: 0.5,
            failures: vec![FailureExample {
                document_id: "inv-7".to_string(),
                predicted_value: "2024-03-31".to_string(),
                expected_value: "2024-03-01".to_string(),
            }],
            successes: Vec::new(),
        }])),
    };
    let run = optimizer(&backend, fast_config()).run(request).await;

    let summary = &run.field_summaries[0];
    assert_eq!(summary.outcome, FieldOutcome::Improved);
    assert_eq!(summary.instruction.as_deref(), Some(ISSUE_DATE));
    assert_eq!(summary.rationale.as_deref(), Some("Listed the date labels."));
    assert!(summary.explanation().contains("new instruction ready"));
}

#[tokio::test]
async fn test_repeated_rejections_exhaust_the_budget() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![
        json_reply(WEAK),
        json_reply(WEAK),
        json_reply(WEAK),
    ]));
    let run = optimizer(&backend, fast_config())
        .run(run_request(&["vendor"]))
        .await;

    assert_eq!(run.status, RunStatus::Review);
    let summary = &run.field_summaries[0];
    assert_eq!(summary.outcome, FieldOutcome::Exhausted);
    assert_eq!(summary.iterations_used, 3);
    assert!(summary
        .last_defects
        .iter()
        .any(|d| d.contains("missing SYNONYMS")));
    assert!(summary.error.is_some());
    assert!(validate(summary.instruction.as_deref().unwrap()).is_valid);
    assert!(summary.explanation().contains("could not improve"));

    let prompts = backend.prompt_requests();
    assert_eq!(prompts.len(), 3);
    assert_eq!(prompts[0].purpose, RequestPurpose::Generation);
    assert_eq!(prompts[2].purpose, RequestPurpose::Repair);
    assert!(prompts[2]
        .prompt
        .contains("SYNONYMS: need 6 distinct quoted phrases, currently have 0"));
    assert!(prompts[2].prompt.contains(WEAK));
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_retry_with_growing_bounded_delays() {
    let backend = Arc::new(ScriptedBackend::with_replies(
        (0..10).map(|_| http_error(503)).collect(),
    ));
    let policy = RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 100,
        max_delay_ms: 250,
        multiplier: 2.0,
        jitter: 0.25,
        ..RetryPolicy::default()
    };
    let caller = ResilientCaller::new(backend.clone(), StaticTokenProvider::new("t"), policy);
    let request = GenerationRequest::new(RequestPurpose::Generation, "prompt", vec![]);

    let err = caller.invoke(&request).await.unwrap_err();
    assert!(matches!(
        err,
        OptimizerError::RetriesExhausted {
            last_class: ErrorClass::TransientServer,
            attempts: 4,
            ..
        }
    ));

    let times = backend.call_times.lock().unwrap().clone();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    // the paused clock fires timers on whole-millisecond ticks
    let tick = Duration::from_millis(1);
    for pair in gaps.windows(2) {
        assert!(pair[1] + tick >= pair[0], "delays shrank: {:?}", gaps);
    }
    assert!(gaps.iter().all(|g| *g <= Duration::from_millis(250) + tick), "{:?}", gaps);
    assert!(gaps[0] >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![
        http_error(401),
        json_reply(GOOD),
    ]));
    let caller = ResilientCaller::new(
        backend.clone(),
        StaticTokenProvider::new("t"),
        RetryPolicy::default(),
    );
    let request = GenerationRequest::new(RequestPurpose::Generation, "prompt", vec![]);

    let err = caller.invoke(&request).await.unwrap_err();
    assert_eq!(err.class(), Some(ErrorClass::Authentication));
    assert!(err.is_run_fatal());
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_attempts_time_out() {
    let backend = Arc::new(ScriptedBackend {
        replies: Mutex::new(vec![json_reply(GOOD), json_reply(GOOD)].into()),
        delay: Some(Duration::from_secs(5)),
        ..ScriptedBackend::default()
    });
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 10,
        max_delay_ms: 10,
        attempt_timeout_ms: 1_000,
        ..RetryPolicy::default()
    };
    let caller = ResilientCaller::new(backend.clone(), StaticTokenProvider::new("t"), policy);
    let request = GenerationRequest::new(RequestPurpose::Generation, "prompt", vec![]);

    let err = caller.invoke(&request).await.unwrap_err();
    assert!(matches!(
        err,
        OptimizerError::RetriesExhausted {
            last_class: ErrorClass::Timeout,
            attempts: 2,
            ..
        }
    ));
}

#[tokio::test]
async fn test_missing_comparison_fails_precheck() {
    let backend = Arc::new(ScriptedBackend::default());
    let mut request = run_request(&["vendor"]);
    request.comparison = None;
    let run = optimizer(&backend, fast_config()).run(request).await;

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("comparison"));
    assert!(run.field_summaries.is_empty());
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_revoked_credentials_abort_the_run() {
    let backend = Arc::new(ScriptedBackend::default());
    let run = PromptOptimizer::new(
        backend.clone(),
        StaticTokenProvider::empty(),
        fast_config(),
    )
    .unwrap()
    .run(run_request(&["vendor"]))
    .await;

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("access token"));
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_perfect_fields_are_skipped() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![json_reply(GOOD)]));
    let mut request = run_request(&["vendor"]);
    request.fields.push(FieldSpec::new(
        FieldDescriptor::new("total", "Total Amount", FieldType::Float),
        "Extract the total.",
    ));
    if let Some(comparison) = request.comparison.as_mut() {
        comparison.fields.push(FieldComparison {
            field_key: "total".to_string(),
            accuracy: 1.0,
            failures: Vec::new(),
            successes: Vec::new(),
        });
    }

    let run = optimizer(&backend, fast_config()).run(request).await;
    assert_eq!(run.status, RunStatus::Review);
    assert_eq!(run.field_summaries.len(), 2);
    assert_eq!(run.field_summaries[0].outcome, FieldOutcome::Improved);
    assert_eq!(run.field_summaries[1].outcome, FieldOutcome::Skipped);
    assert!(run.field_summaries[1]
        .explanation()
        .contains("already matches ground truth"));
    assert_eq!(run.sampled_docs.len(), 1);
}

#[tokio::test]
async fn test_cancellation_keeps_finished_fields() {
    let cancel = CancellationToken::new();
    let backend = Arc::new(ScriptedBackend {
        replies: Mutex::new(vec![json_reply(GOOD), json_reply(GOOD)].into()),
        cancel_on_generation: Some(cancel.clone()),
        ..ScriptedBackend::default()
    });
    let config = OptimizerConfig {
        worker_limit: 1,
        ..fast_config()
    };
    let run = optimizer(&backend, config)
        .with_cancellation_token(cancel)
        .run(run_request(&["first", "second"]))
        .await;

    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().unwrap().to_lowercase().contains("cancelled"));
    assert_eq!(run.field_summaries.len(), 2);
    assert_eq!(run.field_summaries[0].outcome, FieldOutcome::Improved);
    assert_eq!(run.field_summaries[1].outcome, FieldOutcome::Cancelled);
    assert_eq!(backend.prompt_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_limit_bounds_concurrent_calls() {
    let backend = Arc::new(ScriptedBackend {
        replies: Mutex::new((0..5).map(|_| json_reply(GOOD)).collect()),
        delay: Some(Duration::from_millis(50)),
        ..ScriptedBackend::default()
    });
    let config = OptimizerConfig {
        worker_limit: 2,
        ..fast_config()
    };
    let run = optimizer(&backend, config)
        .run(run_request(&["a", "b", "c", "d", "e"]))
        .await;

    assert_eq!(run.status, RunStatus::Review);
    assert_eq!(run.field_summaries.len(), 5);
    assert!(run
        .field_summaries
        .iter()
        .all(|s| s.outcome == FieldOutcome::Improved));
    let keys: Vec<&str> = run.field_summaries.iter().map(|s| s.field_key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_progress_events_and_acknowledge() {
    let backend = Arc::new(ScriptedBackend::with_replies(vec![json_reply(GOOD)]));
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let mut run = optimizer(&backend, fast_config())
        .with_progress(tx)
        .run(run_request(&["vendor"]))
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let stages: Vec<RunStatus> = events
        .iter()
        .filter_map(|e| match e {
            OptimizerEvent::StageEntered { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            RunStatus::Precheck,
            RunStatus::Sampling,
            RunStatus::Diagnostics,
            RunStatus::Prompting,
            RunStatus::Review,
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        OptimizerEvent::FieldFinished {
            outcome: FieldOutcome::Improved,
            ..
        }
    )));
    assert!(matches!(
        events.last(),
        Some(OptimizerEvent::RunFinished {
            status: RunStatus::Review,
            ..
        })
    ));

    let diagnostics: Vec<GenerationRequest> = backend
        .requests()
        .into_iter()
        .filter(|r| r.purpose == RequestPurpose::Diagnostic)
        .collect();
    assert_eq!(diagnostics.len(), 1);
    assert!(backend.prompt_requests()[0]
        .prompt
        .contains("picked a bank name from the remittance block"));

    let summary = run.summary();
    assert_eq!(summary.run_id, run.run_id);
    assert!(summary.completed_at.is_some());

    run.acknowledge().unwrap();
    assert_eq!(run.status, RunStatus::Idle);
}

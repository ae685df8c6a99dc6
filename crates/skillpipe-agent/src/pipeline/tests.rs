use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use skillpipe_sandbox::from_fn;
use skillpipe_telemetry::{MemoryStore, TimeWindow};

use super::*;
use crate::llm::{Completion, CompletionRequest};
use crate::test_support::sample_catalog;

#[derive(Default)]
struct Calls {
    weather: AtomicUsize,
    backup: AtomicUsize,
    read: AtomicUsize,
}

fn handlers(calls: &Arc<Calls>, weather_result: Value) -> HandlerRegistry {
    let (c1, c2, c3) = (calls.clone(), calls.clone(), calls.clone());
    HandlerRegistry::builder()
        .register(
            "read_file",
            from_fn(move |params: Value, _ctx| {
                let calls = c1.clone();
                async move {
                    calls.read.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"content": format!("contents of {}", params["path"].as_str().unwrap_or("?"))}))
                }
            }),
        )
        .register(
            "summarize",
            from_fn(|params: Value, _ctx| async move {
                Ok(json!({"summary": format!("summary: {}", params["content"].as_str().unwrap_or(""))}))
            }),
        )
        .register(
            "send_email",
            from_fn(|params: Value, _ctx| async move { Ok(json!({"sent": true, "body": params["body"]})) }),
        )
        .register(
            "weather",
            from_fn(move |_params: Value, _ctx| {
                let calls = c2.clone();
                let result = weather_result.clone();
                async move {
                    calls.weather.fetch_add(1, Ordering::SeqCst);
                    if result.is_null() {
                        anyhow::bail!("provider unavailable");
                    }
                    Ok(result)
                }
            }),
        )
        .register(
            "weather_backup",
            from_fn(move |_params: Value, _ctx| {
                let calls = c3.clone();
                async move {
                    calls.backup.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"temp": 18}))
                }
            }),
        )
        .build()
}

fn pipeline(calls: &Arc<Calls>, weather_result: Value, store: Arc<MemoryStore>) -> Pipeline {
    Pipeline::builder(sample_catalog(), handlers(calls, weather_result))
        .store(store)
        .build()
}

fn request(utterance: &str) -> TurnRequest {
    TurnRequest::new(ConversationState::new("conv-1", utterance)).with_permissions(["fs.read", "net.send"])
}

#[tokio::test]
async fn test_chain_completes_and_feeds_outputs_downstream() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, json!({"temp": 20}), Arc::new(MemoryStore::default()));
    let report = p
        .run_turn(request("read path=a.txt then summarize it then email it to=bob@x.com"))
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed, "{report:?}");
    assert_eq!(report.intent.kind, IntentKind::NewTask);
    assert_eq!(report.records.len(), 3);
    assert!(report.failed.is_empty() && report.skipped.is_empty());
    let sent = report.task("t3").and_then(|t| t.result.clone()).unwrap();
    assert_eq!(sent["body"], "summary: contents of a.txt");
    assert_eq!(p.usage().tool_count("send_email"), 1);
    assert_eq!(p.usage().skill_count("comms"), 1);
    assert_eq!(report.goal.as_deref(), Some("read path=a.txt then summarize it then email it to=bob@x.com"));
}

#[tokio::test]
async fn test_unresolved_required_slot_never_runs() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, json!({"temp": 20}), Arc::new(MemoryStore::default()));
    let report = p.run_turn(request("what's the weather")).await;

    assert_eq!(report.outcome, TurnOutcome::NeedsInput);
    assert_eq!(report.pending_slots.get("t1"), Some(&vec!["city".to_string()]));
    assert_eq!(report.task("t1").unwrap().status, TaskStatus::Skipped);
    assert!(report.records.is_empty());
    assert_eq!(calls.weather.load(Ordering::SeqCst), 0);

    let mut req = request("what's the weather");
    req.conversation = req.conversation.with_entity("city", json!("Paris"));
    let report = p.run_turn(req).await;
    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.records[0].params, json!({"city": "Paris", "units": "metric"}));
}

#[tokio::test]
async fn test_bounded_retry_skips_dependents_not_siblings() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, Value::Null, Arc::new(MemoryStore::default()));
    let report = p
        .run_turn(request("weather city=Paris then email it to=bob@x.com; read path=a.txt"))
        .await;

    assert_eq!(calls.weather.load(Ordering::SeqCst), 3, "one attempt plus two retries");
    assert_eq!(report.outcome, TurnOutcome::Partial);
    assert_eq!(report.failed, vec!["t1"]);
    assert_eq!(report.skipped, vec!["t2"]);
    let t1 = report.task("t1").unwrap();
    assert_eq!(t1.retry_count, 2);
    assert!(t1.error.as_deref().unwrap().contains("provider unavailable"));
    assert_eq!(report.task("t3").unwrap().status, TaskStatus::Succeeded);
    let attempts: Vec<u32> = report
        .records
        .iter()
        .filter(|r| r.tool_id == "weather")
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_shape_mismatch_replans_with_another_tool() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, json!({"temperature": 20}), Arc::new(MemoryStore::default()));
    let report = p.run_turn(request("weather city=Paris")).await;

    assert_eq!(report.outcome, TurnOutcome::Completed, "{report:?}");
    assert_eq!(calls.weather.load(Ordering::SeqCst), 1, "a wrong shape is not retried");
    assert_eq!(calls.backup.load(Ordering::SeqCst), 1);
    let t1 = report.task("t1").unwrap();
    assert_eq!(t1.status, TaskStatus::Failed);
    assert_eq!(t1.replaced_by.as_deref(), Some("t1-r1"));
    assert_eq!(report.task("t1-r1").unwrap().result, Some(json!({"temp": 18})));
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_permission_denied_fails_task_without_record() {
    let calls = Arc::new(Calls::default());
    let store = Arc::new(MemoryStore::default());
    let p = pipeline(&calls, json!({"temp": 20}), store.clone());
    let req = TurnRequest::new(ConversationState::new("c", "read path=a.txt then summarize it"));
    let report = p.run_turn(req).await;

    assert_eq!(report.outcome, TurnOutcome::Partial);
    assert_eq!(report.failed, vec!["t1"]);
    assert_eq!(report.skipped, vec!["t2"]);
    assert!(report.records.is_empty());
    assert_eq!(calls.read.load(Ordering::SeqCst), 0);
    assert!(report.task("t1").unwrap().error.as_deref().unwrap().contains("fs.read"));
}

#[tokio::test]
async fn test_non_planning_intents() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, json!({"temp": 20}), Arc::new(MemoryStore::default()));

    let report = p.run_turn(request("算了")).await;
    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert!(report.tasks.is_empty());

    let report = p.run_turn(request("   ")).await;
    assert_eq!(report.outcome, TurnOutcome::NeedsClarification);

    let report = p.run_turn(request("dance a jig")).await;
    assert_eq!(report.outcome, TurnOutcome::PlanFailed);
    assert!(report.error.is_some());

    let report = p.run_turn(request("继续")).await;
    assert_eq!(report.outcome, TurnOutcome::PlanFailed, "nothing to continue");

    let mut req = request("继续");
    req.conversation.active_goal = Some("weather city=Paris".into());
    let report = p.run_turn(req).await;
    assert_eq!(report.outcome, TurnOutcome::Completed);
}

#[tokio::test]
async fn test_modification_without_assignments_replaces_goal() {
    let calls = Arc::new(Calls::default());
    let p = pipeline(&calls, json!({"temp": 20}), Arc::new(MemoryStore::default()));

    for utterance in ["改成查询伦敦的天气", "change it to the weather in London"] {
        let mut req = request(utterance);
        req.conversation.active_goal = Some("weather city=Paris".into());
        let report = p.run_turn(req).await;

        assert_eq!(report.intent.kind, IntentKind::ModifyRequirement, "{utterance}");
        assert_eq!(report.goal.as_deref(), Some(utterance));
        assert!(
            report.records.iter().all(|r| r.params["city"] != "Paris"),
            "old request dispatched again: {:?}",
            report.records
        );
    }

    let mut req = request("改成 city=London");
    req.conversation.active_goal = Some("weather city=Paris".into());
    let report = p.run_turn(req).await;
    assert_eq!(report.goal.as_deref(), Some("weather city=London"));
    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.records[0].params["city"], "London");
}

struct HangingLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmService for HangingLlm {
    async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Completion {
            content: r#"{"intent":"NEW_TASK","confidence":0.9,"reason":"late"}"#.to_string(),
        })
    }
}

#[tokio::test]
async fn test_cancellation_during_llm_classification() {
    let calls = Arc::new(Calls::default());
    let llm = Arc::new(HangingLlm {
        calls: AtomicUsize::new(0),
    });
    let p = Pipeline::builder(sample_catalog(), handlers(&calls, json!({"temp": 20})))
        .store(Arc::new(MemoryStore::default()))
        .llm(llm.clone())
        .build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let report = p
        .run_turn(request("plan a trip to the coast").with_cancel(cancel))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert!(report.tasks.is_empty());
}

#[tokio::test]
async fn test_every_stage_is_timed() {
    let calls = Arc::new(Calls::default());
    let store = Arc::new(MemoryStore::default());
    let p = pipeline(&calls, json!({"temp": 20}), store.clone());
    p.run_turn(request("read path=a.txt then summarize it then email it to=bob@x.com"))
        .await;

    let count = |stage| p.monitor().query(stage, TimeWindow::All).unwrap().count;
    assert_eq!(count(Stage::Classify), 1);
    assert_eq!(count(Stage::Plan), 1);
    assert_eq!(count(Stage::FillSlots), 3);
    assert_eq!(count(Stage::Execute), 3);
    assert_eq!(count(Stage::Validate), 3);
}

#[tokio::test]
async fn test_cancellation_skips_in_flight_task() {
    let store = Arc::new(MemoryStore::default());
    let registry = HandlerRegistry::builder()
        .register(
            "weather",
            from_fn(|_params: Value, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!({"temp": 1}))
            }),
        )
        .build();
    let p = Pipeline::builder(sample_catalog(), registry).store(store).build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let report = p
        .run_turn(request("weather city=Paris; weather city=Oslo").with_cancel(cancel))
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Skipped));
    assert_eq!(p.usage().tool_count("weather"), 0);
}

#[tokio::test]
async fn test_parallel_dispatch_is_bounded() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, pk) = (active.clone(), peak.clone());
    let registry = HandlerRegistry::builder()
        .register(
            "read_file",
            from_fn(move |_params: Value, _ctx| {
                let (active, peak) = (a.clone(), pk.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({"content": "x"}))
                }
            }),
        )
        .build();
    let config = PipelineConfig {
        max_parallel: 2,
        ..PipelineConfig::default()
    };
    let p = Pipeline::builder(sample_catalog(), registry).config(config).build();
    let report = p
        .run_turn(request("read path=a; read path=b; read path=c; read path=d"))
        .await;

    assert_eq!(report.outcome, TurnOutcome::Completed);
    assert_eq!(report.records.len(), 4);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

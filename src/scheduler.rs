//! Trigger scheduler.
//!
//! One background loop advances every active flow once per tick: fetch the
//! polled source, extract the monitored field, decide what the trigger
//! means for this flow, dispatch, and persist the new runtime state. The
//! decision itself is a pure function over the flow and what the tick
//! observed, so the transitions are testable without any IO.
//!
//! State only advances when dispatch reports success. A failed delivery
//! leaves `last_run`/`last_value` untouched and the same trigger is retried
//! on the next tick instead of being silently skipped.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::dispatch::{Deliver, Delivery};
use crate::error::{Error, Result};
use crate::flow::{Flow, TriggerType};
use crate::store::FlowStore;
use crate::template::lookup::{canonical_string, lookup_path, normalize_path};

const FETCH_TIMEOUT_SECS: u64 = 5;
const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;
/// Consecutive loop faults before the counter self-heals back to zero.
const BACKOFF_RESET_AFTER: u32 = 5;

/// What one tick observed for one flow.
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    /// Unix seconds at the start of the tick.
    pub now: i64,
    /// Fetched source payload, when the flow has one.
    pub payload: Option<Value>,
    /// Canonical string form of the extracted field.
    pub value: Option<String>,
}

/// Pure per-flow transition decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    /// First observation of an on-change flow: persist the baseline
    /// without dispatching, so activation never fires a spurious change.
    SeedBaseline { value: String },
    /// The trigger fired; dispatch with this rendering context.
    Dispatch { context: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    /// Advanced by inbound deliveries only, never by the poller.
    IncomingOnly,
    NotDue,
    Unchanged,
    /// On-change flows need both an endpoint and a field path.
    MissingSource,
    /// The field path did not resolve in the fetched payload.
    ExtractionFailed,
}

/// Decide what this tick means for one flow.
pub fn decide(flow: &Flow, ctx: &TickContext) -> Decision {
    if !flow.active {
        return Decision::Skip(SkipReason::Inactive);
    }

    match flow.trigger_type {
        TriggerType::OnIncoming => Decision::Skip(SkipReason::IncomingOnly),

        TriggerType::Timer => {
            let last_run = flow.last_run.unwrap_or(0);
            if ctx.now - last_run < (flow.interval * 60) as i64 {
                return Decision::Skip(SkipReason::NotDue);
            }
            Decision::Dispatch { context: dispatch_context(flow, ctx) }
        }

        TriggerType::OnChange => {
            if flow.endpoint.is_none() || flow.field.is_none() {
                return Decision::Skip(SkipReason::MissingSource);
            }
            let Some(current) = ctx.value.as_deref() else {
                return Decision::Skip(SkipReason::ExtractionFailed);
            };
            match flow.last_value.as_deref() {
                None => Decision::SeedBaseline { value: current.to_string() },
                Some(baseline) if baseline == current => Decision::Skip(SkipReason::Unchanged),
                Some(_) => Decision::Dispatch { context: dispatch_context(flow, ctx) },
            }
        }
    }
}

/// Merge the fetched payload with the reserved trigger bindings.
fn dispatch_context(flow: &Flow, ctx: &TickContext) -> Value {
    let mut context = match &ctx.payload {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => json!({ "api_data": other }),
        None => json!({}),
    };
    if let Value::Object(map) = &mut context {
        map.insert(
            "value".to_string(),
            ctx.value.as_deref().map(|v| json!(v)).unwrap_or(Value::Null),
        );
        map.insert(
            "old_value".to_string(),
            flow.last_value.as_deref().map(|v| json!(v)).unwrap_or(Value::Null),
        );
        map.insert("api_data".to_string(), ctx.payload.clone().unwrap_or(Value::Null));
    }
    context
}

/// Runtime-state changes to apply to a flow after its dispatch resolved.
#[derive(Debug, Default, Clone)]
struct FlowUpdate {
    last_run: Option<i64>,
    last_value: Option<String>,
    last_data: Option<Value>,
}

impl FlowUpdate {
    fn apply(self, flow: &mut Flow) {
        if let Some(run) = self.last_run {
            flow.last_run = Some(run);
        }
        if let Some(value) = self.last_value {
            flow.last_value = Some(value);
        }
        if let Some(data) = self.last_data {
            flow.last_data = Some(data);
        }
    }
}

/// State advance after a successful (or suppressed) dispatch.
fn advance_update(flow: &Flow, ctx: &TickContext) -> FlowUpdate {
    FlowUpdate {
        last_run: matches!(flow.trigger_type, TriggerType::Timer).then_some(ctx.now),
        last_value: ctx.value.clone(),
        last_data: ctx.payload.clone(),
    }
}

/// Summary of one polling tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub checked: usize,
    pub dispatched: usize,
    pub suppressed: usize,
    pub seeded: usize,
    pub failed: usize,
    /// Settings value picked up during this tick.
    pub check_interval: u64,
}

/// The background polling loop.
pub struct Scheduler {
    store: Arc<FlowStore>,
    dispatcher: Arc<dyn Deliver>,
    client: Client,
}

impl Scheduler {
    pub fn new(store: Arc<FlowStore>, dispatcher: Arc<dyn Deliver>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build poll client with defaults: {}", e);
                Client::new()
            });
        Self { store, dispatcher, client }
    }

    /// Run the polling loop forever. Loop-level faults back off
    /// exponentially and the loop always survives them.
    pub async fn run(&self) {
        info!("scheduler started");
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.tick().await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if report.dispatched + report.suppressed + report.seeded + report.failed > 0 {
                        info!(
                            checked = report.checked,
                            dispatched = report.dispatched,
                            suppressed = report.suppressed,
                            seeded = report.seeded,
                            failed = report.failed,
                            "tick complete"
                        );
                    }
                    tokio::time::sleep(Duration::from_secs(report.check_interval.max(1))).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = backoff_secs(consecutive_errors);
                    error!(
                        error = %e,
                        consecutive = consecutive_errors,
                        backoff_secs = backoff,
                        "scheduler tick failed"
                    );
                    if consecutive_errors >= BACKOFF_RESET_AFTER {
                        consecutive_errors = 0;
                    }
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    /// Advance every active flow once.
    pub async fn tick(&self) -> Result<TickReport> {
        let doc = self.store.load().await?;
        let mut report =
            TickReport { check_interval: doc.settings.check_interval, ..Default::default() };
        let mut updates: Vec<(String, FlowUpdate)> = Vec::new();

        for flow in doc.flows.iter().filter(|f| f.active) {
            if flow.trigger_type == TriggerType::OnIncoming {
                continue;
            }
            report.checked += 1;

            // A fault in one flow never aborts the tick for the others.
            match self.check_flow(flow).await {
                Ok(Some((update, outcome))) => {
                    match outcome {
                        FlowOutcome::Dispatched => report.dispatched += 1,
                        FlowOutcome::Suppressed => report.suppressed += 1,
                        FlowOutcome::Seeded => report.seeded += 1,
                    }
                    updates.push((flow.name.clone(), update));
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(flow = %flow.name, error = %e, "flow skipped this tick");
                }
            }
        }

        if !updates.is_empty() {
            self.store
                .update(|doc| {
                    for (name, update) in updates {
                        if let Some(flow) = doc.flow_mut(&name) {
                            update.apply(flow);
                        }
                    }
                    (true, ())
                })
                .await?;
        }

        Ok(report)
    }

    async fn check_flow(&self, flow: &Flow) -> Result<Option<(FlowUpdate, FlowOutcome)>> {
        let now = chrono::Utc::now().timestamp();

        let payload = match &flow.endpoint {
            Some(endpoint) if !endpoint.is_empty() => {
                Some(fetch_source(&self.client, endpoint, flow).await?)
            }
            _ => None,
        };

        let value = match (&payload, &flow.field) {
            (Some(data), Some(field)) if !field.is_empty() => {
                lookup_path(data, &normalize_path(field)).map(canonical_string)
            }
            _ => None,
        };

        let ctx = TickContext { now, payload, value };

        match decide(flow, &ctx) {
            Decision::Skip(_) => Ok(None),
            Decision::SeedBaseline { value } => {
                info!(flow = %flow.name, baseline = %value, "baseline seeded");
                Ok(Some((
                    FlowUpdate { last_value: Some(value), ..Default::default() },
                    FlowOutcome::Seeded,
                )))
            }
            Decision::Dispatch { context } => {
                if flow.trigger_type == TriggerType::OnChange {
                    info!(
                        flow = %flow.name,
                        field = flow.field.as_deref().unwrap_or(""),
                        old = flow.last_value.as_deref().unwrap_or(""),
                        new = ctx.value.as_deref().unwrap_or(""),
                        "change detected"
                    );
                }
                let outcome = self
                    .dispatcher
                    .deliver(&flow.message_template, flow, Some(&context))
                    .await?;
                let kind = match outcome {
                    Delivery::Sent => FlowOutcome::Dispatched,
                    Delivery::Suppressed => FlowOutcome::Suppressed,
                };
                Ok(Some((advance_update(flow, &ctx), kind)))
            }
        }
    }

    /// Handle an inbound event for an on-incoming flow: store the payload
    /// and dispatch immediately, bypassing the poller.
    pub async fn deliver_incoming(&self, flow_name: &str, payload: Value) -> Result<Delivery> {
        let doc = self.store.load().await?;
        let flow = doc
            .flow(flow_name)
            .ok_or_else(|| Error::Config(format!("flow '{}' not found", flow_name)))?
            .clone();

        if !flow.active {
            return Err(Error::Config(format!("flow '{}' is not active", flow_name)));
        }

        self.store
            .update(|doc| {
                if let Some(f) = doc.flow_mut(flow_name) {
                    f.last_data = Some(payload.clone());
                    (true, ())
                } else {
                    (false, ())
                }
            })
            .await?;

        self.dispatcher.deliver(&flow.message_template, &flow, Some(&payload)).await
    }
}

#[derive(Debug, Clone, Copy)]
enum FlowOutcome {
    Dispatched,
    Suppressed,
    Seeded,
}

fn backoff_secs(consecutive_errors: u32) -> u64 {
    let doublings = consecutive_errors.saturating_sub(1).min(6);
    (BACKOFF_BASE_SECS << doublings).min(BACKOFF_CAP_SECS)
}

/// Fetch a flow's polled source.
///
/// GET by default; POST when a request body is configured. A declared JSON
/// content type sends the body as parsed JSON (raw on parse failure). With
/// no JSON content type, a body that looks like a bare GraphQL document is
/// wrapped as `{"query": ...}`; anything else goes out as a raw payload.
async fn fetch_source(client: &Client, endpoint: &str, flow: &Flow) -> Result<Value> {
    let apply_headers = |mut req: reqwest::RequestBuilder| {
        for header in &flow.headers {
            req = req.header(&header.key, &header.value);
        }
        req
    };

    let request = match flow.request_body.as_deref().filter(|b| !b.trim().is_empty()) {
        Some(body) => {
            let req = apply_headers(client.post(endpoint));
            let json_declared = flow.headers.iter().any(|h| {
                h.key.eq_ignore_ascii_case("content-type")
                    && h.value.to_lowercase().contains("application/json")
            });
            if json_declared {
                match serde_json::from_str::<Value>(body) {
                    Ok(parsed) => req.json(&parsed),
                    Err(_) => req.body(body.to_string()),
                }
            } else if body.trim().starts_with('{') && !body.contains("query") {
                req.json(&json!({ "query": body }))
            } else {
                req.body(body.to_string())
            }
        }
        None => apply_headers(client.get(endpoint)),
    };

    let response = request
        .send()
        .await
        .map_err(|e| Error::Fetch(format!("request to {} failed: {}", endpoint, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Fetch(format!("{} returned {}", endpoint, status)));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Fetch(format!("unparseable response from {}: {}", endpoint, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct MockDeliver {
        fail: AtomicBool,
        outcome: Delivery,
        calls: Mutex<Vec<String>>,
    }

    impl MockDeliver {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                outcome: Delivery::Sent,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Deliver for MockDeliver {
        async fn deliver(
            &self,
            _template: &str,
            flow: &Flow,
            _data: Option<&Value>,
        ) -> Result<Delivery> {
            self.calls.lock().unwrap().push(flow.name.clone());
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Dispatch("mock failure".to_string()))
            } else {
                Ok(self.outcome)
            }
        }
    }

    fn on_change_flow() -> Flow {
        let mut flow = Flow::new("watch", TriggerType::OnChange);
        flow.active = true;
        flow.endpoint = Some("http://api.example/status".to_string());
        flow.field = Some("state".to_string());
        flow
    }

    fn ctx(now: i64, value: Option<&str>) -> TickContext {
        TickContext {
            now,
            payload: Some(json!({"state": value})),
            value: value.map(|v| v.to_string()),
        }
    }

    #[test]
    fn test_decide_inactive_and_incoming_skip() {
        let mut flow = Flow::new("f", TriggerType::Timer);
        assert_eq!(
            decide(&flow, &TickContext::default()),
            Decision::Skip(SkipReason::Inactive)
        );

        flow.active = true;
        flow.trigger_type = TriggerType::OnIncoming;
        assert_eq!(
            decide(&flow, &TickContext::default()),
            Decision::Skip(SkipReason::IncomingOnly)
        );
    }

    #[test]
    fn test_decide_timer_due_boundary() {
        let mut flow = Flow::new("t", TriggerType::Timer);
        flow.active = true;
        flow.interval = 1;
        flow.last_run = Some(1_000);

        // 59 seconds after the last run: not due.
        let not_due = TickContext { now: 1_059, ..Default::default() };
        assert_eq!(decide(&flow, &not_due), Decision::Skip(SkipReason::NotDue));

        // Exactly 60 seconds: due.
        let due = TickContext { now: 1_060, ..Default::default() };
        assert!(matches!(decide(&flow, &due), Decision::Dispatch { .. }));
    }

    #[test]
    fn test_decide_timer_context_bindings() {
        let mut flow = Flow::new("t", TriggerType::Timer);
        flow.active = true;
        flow.interval = 1;
        flow.last_value = Some("old".to_string());

        let tick = TickContext {
            now: 10_000,
            payload: Some(json!({"level": 7})),
            value: Some("7".to_string()),
        };
        let Decision::Dispatch { context } = decide(&flow, &tick) else {
            panic!("expected dispatch");
        };
        assert_eq!(context["level"], 7);
        assert_eq!(context["value"], "7");
        assert_eq!(context["old_value"], "old");
    }

    #[test]
    fn test_decide_on_change_seeds_then_fires() {
        let flow = on_change_flow();

        // First observation seeds the baseline without dispatching.
        assert_eq!(
            decide(&flow, &ctx(0, Some("A"))),
            Decision::SeedBaseline { value: "A".to_string() }
        );

        let mut seeded = flow.clone();
        seeded.last_value = Some("A".to_string());

        assert_eq!(decide(&seeded, &ctx(1, Some("A"))), Decision::Skip(SkipReason::Unchanged));

        let Decision::Dispatch { context } = decide(&seeded, &ctx(2, Some("B"))) else {
            panic!("expected dispatch on change");
        };
        assert_eq!(context["value"], "B");
        assert_eq!(context["old_value"], "A");
    }

    #[test]
    fn test_decide_on_change_requires_source_and_extraction() {
        let mut flow = on_change_flow();
        flow.endpoint = None;
        assert_eq!(
            decide(&flow, &ctx(0, Some("A"))),
            Decision::Skip(SkipReason::MissingSource)
        );

        let flow = on_change_flow();
        let failed = TickContext { now: 0, payload: Some(json!({})), value: None };
        assert_eq!(decide(&flow, &failed), Decision::Skip(SkipReason::ExtractionFailed));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(1), 1);
        assert_eq!(backoff_secs(2), 2);
        assert_eq!(backoff_secs(3), 4);
        assert_eq!(backoff_secs(5), 16);
        assert_eq!(backoff_secs(7), 60);
        assert_eq!(backoff_secs(100), 60);
    }

    fn test_scheduler(
        dir: &tempfile::TempDir,
        mock: Arc<MockDeliver>,
    ) -> (Scheduler, Arc<FlowStore>) {
        let store = Arc::new(FlowStore::open(dir.path().join("flows.json")));
        let scheduler = Scheduler::new(store.clone(), mock);
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_tick_advances_timer_only_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDeliver::new());
        let (scheduler, store) = test_scheduler(&dir, mock.clone());

        // A sourceless timer flow dispatches a static template.
        let mut flow = Flow::new("heartbeat", TriggerType::Timer);
        flow.active = true;
        flow.interval = 1;
        flow.message_template = "ping".to_string();
        store.upsert_flow(flow).await.unwrap();

        // Failed dispatch: state untouched, trigger retried next tick.
        mock.fail.store(true, Ordering::SeqCst);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.load().await.unwrap().flow("heartbeat").unwrap().last_run.is_none());

        // Successful dispatch advances last_run.
        mock.fail.store(false, Ordering::SeqCst);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        let doc = store.load().await.unwrap();
        assert!(doc.flow("heartbeat").unwrap().last_run.is_some());

        // Now the flow is not due: no further dispatch.
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_tick_skips_inactive_and_incoming() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDeliver::new());
        let (scheduler, store) = test_scheduler(&dir, mock.clone());

        let mut inactive = Flow::new("off", TriggerType::Timer);
        inactive.active = false;
        store.upsert_flow(inactive).await.unwrap();

        let mut incoming = Flow::new("hook", TriggerType::OnIncoming);
        incoming.active = true;
        store.upsert_flow(incoming).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_deliver_incoming_stores_payload_and_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDeliver::new());
        let (scheduler, store) = test_scheduler(&dir, mock.clone());

        let mut flow = Flow::new("hook", TriggerType::OnIncoming);
        flow.active = true;
        store.upsert_flow(flow).await.unwrap();

        let payload = json!({"event": "created", "id": 7});
        let outcome = scheduler.deliver_incoming("hook", payload.clone()).await.unwrap();
        assert_eq!(outcome, Delivery::Sent);
        assert_eq!(mock.call_count(), 1);

        let doc = store.load().await.unwrap();
        assert_eq!(doc.flow("hook").unwrap().last_data, Some(payload));

        assert!(scheduler.deliver_incoming("absent", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_deliver_incoming_rejects_inactive_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDeliver::new());
        let (scheduler, store) = test_scheduler(&dir, mock.clone());

        store.upsert_flow(Flow::new("hook", TriggerType::OnIncoming)).await.unwrap();
        assert!(scheduler.deliver_incoming("hook", json!({})).await.is_err());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_suppressed_dispatch_still_advances_state() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDeliver {
            fail: AtomicBool::new(false),
            outcome: Delivery::Suppressed,
            calls: Mutex::new(Vec::new()),
        });
        let (scheduler, store) = test_scheduler(&dir, mock.clone());

        let mut flow = Flow::new("gated", TriggerType::Timer);
        flow.active = true;
        flow.interval = 1;
        store.upsert_flow(flow).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.suppressed, 1);
        // Handled counts as success: the timer does not refire immediately.
        assert!(store.load().await.unwrap().flow("gated").unwrap().last_run.is_some());
    }
}

//! End-to-end runs of the dashboard domain against an in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;

use taskfold::dashboard::attribute_filter::{
    AttributeFilterConfig, InitStatus, Selection, select_attribute_filter,
    select_is_working_selection_changed,
};
use taskfold::dashboard::backend::{
    AttributeElement, AttributeFilterBackend, AttributeMetadata, BackendCapabilities, Catalog,
    ElementsPage, ElementsRequest, LimitingAttributeFilter, LimitingCriteria,
};
use taskfold::dashboard::filter_context::select_filter_context_items;
use taskfold::dashboard::init::{ATTRIBUTE_FILTER_CONFIGURE, ATTRIBUTE_FILTER_INIT, InitEvent};
use taskfold::dashboard::queries::keys_for_display_form;
use taskfold::dashboard::{self, DashboardState};
use taskfold::{
    COMMAND_FAILED, CollaboratorError, Command, CommandFailed, Engine, Event, FailureReason, Query,
    QueryDescriptor, TaskContext, TaskError,
};

const REGION: &str = "label.region";

/// In-memory backend recording every call.
struct MockBackend {
    catalog: Option<Catalog>,
    attributes: HashMap<String, AttributeMetadata>,
    elements: Vec<AttributeElement>,
    /// Keys passing any limiting criterion.
    relevant: HashSet<String>,
    capabilities: BackendCapabilities,
    fail_elements: bool,
    /// When set, `load_attribute` waits for a permit.
    attribute_gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new() -> Self {
        let region = AttributeMetadata {
            display_form: REGION.into(),
            attribute: "attr.region".into(),
            title: "Region".into(),
        };
        Self {
            catalog: None,
            attributes: HashMap::from([(REGION.to_owned(), region)]),
            elements: ["east", "west", "north", "south", "hidden"]
                .into_iter()
                .map(|k| AttributeElement::new(k, k.to_uppercase()))
                .collect(),
            relevant: ["east", "west"].into_iter().map(String::from).collect(),
            capabilities: BackendCapabilities {
                supports_irrelevant_elements: true,
            },
            fail_elements: false,
            attribute_gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.attribute_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_owned());
    }
}

#[async_trait]
impl AttributeFilterBackend for MockBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn load_catalog(&self) -> Result<Catalog, CollaboratorError> {
        self.record("catalog");
        self.catalog
            .clone()
            .ok_or_else(|| CollaboratorError::Unavailable("catalog service down".into()))
    }

    async fn load_attribute(
        &self,
        display_form: &str,
    ) -> Result<AttributeMetadata, CollaboratorError> {
        self.record("attribute");
        if let Some(gate) = &self.attribute_gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| CollaboratorError::Cancelled)?;
        }
        self.record("attribute-done");
        self.attributes
            .get(display_form)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(display_form.to_owned()))
    }

    async fn load_elements(
        &self,
        request: &ElementsRequest,
    ) -> Result<ElementsPage, CollaboratorError> {
        let label = if request.include_total_count_without_filters {
            "total"
        } else if request.keys.is_some() && request.limiting_attribute_filters.is_empty() {
            "selected"
        } else if request.keys.is_some() {
            "irrelevant"
        } else {
            "page"
        };
        self.record(label);
        if self.fail_elements {
            return Err(CollaboratorError::Unavailable("elements service down".into()));
        }

        let limited = !request.limiting_attribute_filters.is_empty()
            && !request.include_total_count_without_filters;
        let matching: Vec<AttributeElement> = self
            .elements
            .iter()
            .filter(|e| request.keys.as_ref().is_none_or(|keys| keys.contains(&e.key)))
            .filter(|e| !request.excluded_keys.contains(&e.key))
            .filter(|e| !limited || self.relevant.contains(&e.key))
            .cloned()
            .collect();
        let elements = matching
            .iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .cloned()
            .collect();
        Ok(ElementsPage {
            elements,
            total_count: matching.len() as u64,
            offset: request.offset,
            limit: request.limit,
        })
    }
}

fn engine(backend: &Arc<MockBackend>) -> Engine<DashboardState> {
    let backend: Arc<dyn AttributeFilterBackend> = backend.clone();
    dashboard::register(Engine::builder(DashboardState::default()), backend)
        .build()
        .unwrap()
}

async fn configure(engine: &Engine<DashboardState>, config: &AttributeFilterConfig) {
    let event = engine
        .dispatch(Command::typed(ATTRIBUTE_FILTER_CONFIGURE, config).unwrap())
        .await;
    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_CONFIGURE_COMPLETED");
}

fn region(filter_id: &str) -> AttributeFilterConfig {
    AttributeFilterConfig::new(filter_id, REGION)
}

fn init(filter_id: &str) -> Command {
    Command::new(ATTRIBUTE_FILTER_INIT).with_payload(json!({ "filterId": filter_id }))
}

/// Poll until `pred` holds, failing after a second.
async fn until(what: &str, pred: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn filter(
    engine: &Engine<DashboardState>,
    id: &str,
) -> taskfold::dashboard::attribute_filter::AttributeFilter {
    let selected = engine.select(&select_attribute_filter(id));
    Option::clone(&selected).unwrap()
}

#[tokio::test]
async fn unknown_command_fails_without_mutation() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);

    let event = engine
        .dispatch(Command::new("NOPE").with_payload(json!({})))
        .await;

    assert_eq!(event.event_type, COMMAND_FAILED);
    let failed = CommandFailed::from_event(&event).unwrap();
    assert_eq!(failed.reason, FailureReason::UnknownCommand);
    assert_eq!(engine.store().version(), 0);
    assert_eq!(engine.read(|s| s.clone()), DashboardState::default());
}

#[tokio::test]
async fn hidden_elements_load_attribute_before_page() {
    let (backend, gate) = MockBackend::new().gated();
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    let mut config = AttributeFilterConfig::new("f1", REGION);
    config.hidden_elements = vec!["hidden".into()];
    configure(&engine, &config).await;

    let pending = engine.submit(init("f1"));
    until("attribute", || backend.count("attribute") == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.count("page"), 0, "page requested before attribute resolved");

    gate.add_permits(16);
    let event = pending.await;
    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_INIT_SUCCESS");

    let calls = backend.calls();
    let done = calls.iter().position(|c| c == "attribute-done").unwrap();
    let page = calls.iter().position(|c| c == "page").unwrap();
    assert!(done < page);

    let loaded = filter(&engine, "f1");
    assert_eq!(loaded.init_status, InitStatus::Loaded);
    assert_eq!(loaded.attribute.unwrap().title, "Region");
    assert!(loaded.elements.iter().all(|e| e.key != "hidden"));
    assert_eq!(loaded.total_count, Some(4));
}

#[tokio::test]
async fn without_hidden_elements_attribute_and_page_start_together() {
    let (backend, gate) = MockBackend::new().gated();
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;

    let pending = engine.submit(init("f1"));
    until("attribute and page calls", || {
        backend.count("attribute") == 1 && backend.count("page") == 1
    })
    .await;
    assert_eq!(backend.count("attribute-done"), 0);

    gate.add_permits(16);
    assert_eq!(pending.await.event_type, "ATTRIBUTE_FILTER_INIT_SUCCESS");
    assert_eq!(filter(&engine, "f1").elements.len(), 5);
}

#[tokio::test]
async fn init_runs_conditional_children() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    let mut config = AttributeFilterConfig::new("f1", REGION);
    config.limiting = LimitingCriteria {
        attribute_filters: vec![LimitingAttributeFilter {
            display_form: "label.country".into(),
            keys: vec!["us".into()],
            negative: false,
        }],
        ..LimitingCriteria::default()
    };
    config.selection = Selection::only(["east", "south"]);
    configure(&engine, &config).await;

    let event = engine.dispatch(init("f1")).await;
    assert_eq!(
        event.decode::<InitEvent>(),
        Some(InitEvent::Success {
            filter_id: "f1".into(),
            elements_count: 2,
            total_count: 2,
        })
    );
    for call in ["total", "irrelevant", "selected"] {
        assert_eq!(backend.count(call), 1, "{call}");
    }

    let loaded = filter(&engine, "f1");
    assert_eq!(loaded.total_count_without_filters, Some(5));
    assert_eq!(loaded.irrelevant_selection, vec!["south"]);
    let selected: Vec<_> = loaded
        .selected_elements
        .iter()
        .map(|e| e.key.as_str())
        .collect();
    assert_eq!(selected, vec!["east", "south"]);
}

#[tokio::test]
async fn init_skips_children_whose_preconditions_fail() {
    let mut backend = MockBackend::new();
    backend.capabilities.supports_irrelevant_elements = false;
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    let mut config = AttributeFilterConfig::new("f1", REGION);
    config.selection = Selection::only(["east"]);
    configure(&engine, &config).await;

    assert_eq!(engine.dispatch(init("f1")).await.event_type, "ATTRIBUTE_FILTER_INIT_SUCCESS");
    assert_eq!(backend.count("total"), 0);
    assert_eq!(backend.count("irrelevant"), 0);
    assert_eq!(backend.count("selected"), 1);
    assert_eq!(filter(&engine, "f1").total_count_without_filters, None);
}

#[tokio::test]
async fn concurrent_inits_share_backend_calls() {
    let (backend, gate) = MockBackend::new().gated();
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;
    configure(&engine, &region("f2")).await;

    let first = engine.submit(init("f1"));
    let second = engine.submit(init("f2"));
    until("attribute", || backend.count("attribute") == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    gate.add_permits(16);

    assert_eq!(first.await.event_type, "ATTRIBUTE_FILTER_INIT_SUCCESS");
    assert_eq!(second.await.event_type, "ATTRIBUTE_FILTER_INIT_SUCCESS");
    assert_eq!(backend.count("attribute"), 1);
    assert_eq!(backend.count("page"), 1);
    assert!(engine.queries().stats().joins + engine.queries().stats().hits >= 2);
}

#[tokio::test]
async fn second_init_hits_cache_until_invalidated() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;

    engine.dispatch(init("f1")).await;
    engine.dispatch(init("f1")).await;
    assert_eq!(backend.count("attribute"), 1);
    assert_eq!(backend.count("page"), 1);

    assert_eq!(engine.invalidate(keys_for_display_form(REGION)), 2);
    engine.dispatch(init("f1")).await;
    assert_eq!(backend.count("attribute"), 2);
    assert_eq!(backend.count("page"), 2);
}

#[tokio::test]
async fn failed_catalog_is_retried_and_live_lookup_is_used() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;
    configure(&engine, &region("f2")).await;

    engine.dispatch(init("f1")).await;
    engine.dispatch(init("f2")).await;
    // The rejected catalog fetch is evicted, so each resolution tries again.
    assert_eq!(backend.count("catalog"), 2);
    assert_eq!(backend.count("attribute"), 1);

    let load = engine
        .dispatch(Command::new(dashboard::catalog::CATALOG_LOAD))
        .await;
    assert_eq!(load.event_type, "CATALOG_LOAD_FAILED");
}

#[tokio::test]
async fn missing_attribute_fails_init_and_records_error() {
    let mut backend = MockBackend::new();
    backend.attributes.clear();
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;

    let event = engine.dispatch(init("f1")).await;
    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_INIT_ERROR");
    let loaded = filter(&engine, "f1");
    assert!(matches!(loaded.init_status, InitStatus::Failed(ref m) if m.contains("not found")));
    assert!(loaded.elements.is_empty());
}

#[tokio::test]
async fn hidden_path_keeps_attribute_when_page_fails() {
    let mut backend = MockBackend::new();
    backend.fail_elements = true;
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    let mut config = AttributeFilterConfig::new("f1", REGION);
    config.hidden_elements = vec!["hidden".into()];
    configure(&engine, &config).await;

    let event = engine.dispatch(init("f1")).await;
    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_INIT_ERROR");
    let loaded = filter(&engine, "f1");
    assert!(loaded.attribute.is_some());
    assert_eq!(loaded.total_count, None);
}

#[tokio::test]
async fn cancelled_init_emits_cancel_and_stops_writing() {
    let (backend, gate) = MockBackend::new().gated();
    let backend = Arc::new(backend);
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;
    let version = engine.store().version();

    let pending = engine.submit(init("f1"));
    until("attribute", || backend.count("attribute") == 1).await;
    pending.cancel();
    let event = pending.await;

    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_INIT_CANCEL");
    // Only the InitStarted write landed.
    assert_eq!(engine.store().version(), version + 1);
    let loaded = filter(&engine, "f1");
    assert_eq!(loaded.init_status, InitStatus::Loading);
    assert!(loaded.elements.is_empty());

    gate.add_permits(16);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(engine.store().version(), version + 1);
}

#[tokio::test]
async fn init_events_arrive_in_emission_order() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = engine.subscribe_to_events(
        |e: &Event| e.correlation_id.as_deref() == Some("init-1"),
        move |e: &Event| sink.lock().push(e.event_type.clone()),
    );

    engine.dispatch(init("f1").with_correlation_id("init-1")).await;
    until("terminal event", || seen.lock().len() == 3).await;
    assert_eq!(
        *seen.lock(),
        vec![
            "COMMAND_STARTED",
            "ATTRIBUTE_FILTER_INIT_REQUESTED",
            "ATTRIBUTE_FILTER_INIT_SUCCESS"
        ]
    );
}

#[tokio::test]
async fn init_of_unknown_filter_is_a_command_failure() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    let event = engine.dispatch(init("missing")).await;
    let failed = CommandFailed::from_event(&event).unwrap();
    assert_eq!(failed.reason, FailureReason::HandlerError);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn selection_commands_edit_and_commit() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    configure(&engine, &region("f1")).await;
    let changed = select_is_working_selection_changed("f1");

    let event = engine
        .dispatch(Command::new("ATTRIBUTE_FILTER_CHANGE_SELECTION").with_payload(json!({
            "filterId": "f1",
            "selection": { "keys": ["east"], "negative": false }
        })))
        .await;
    assert_eq!(event.event_type, "ATTRIBUTE_FILTER_SELECTION_CHANGED");
    assert!(*engine.select(&changed));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = engine.subscribe_to_events(
        |e: &Event| e.event_type.starts_with("ATTRIBUTE_FILTER_SELECTION"),
        move |e: &Event| sink.lock().push(e.event_type.clone()),
    );
    engine
        .dispatch(
            Command::new("ATTRIBUTE_FILTER_COMMIT_SELECTION")
                .with_payload(json!({ "filterId": "f1" })),
        )
        .await;
    until("commit events", || seen.lock().len() == 2).await;
    assert_eq!(
        *seen.lock(),
        vec!["ATTRIBUTE_FILTER_SELECTION_COMMITTED", "ATTRIBUTE_FILTER_SELECTION_CHANGED"]
    );
    assert!(!*engine.select(&changed));
    assert_eq!(filter(&engine, "f1").committed_selection, Selection::only(["east"]));

    let unknown = engine
        .dispatch(
            Command::new("ATTRIBUTE_FILTER_CLEAR_SELECTION")
                .with_payload(json!({ "filterId": "nope" })),
        )
        .await;
    assert_eq!(unknown.event_type, COMMAND_FAILED);
}

#[tokio::test]
async fn filter_context_add_move_remove() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    let add = |df: &str, id: &str, index: i64| {
        Command::new("FILTER_CONTEXT_ADD_ATTRIBUTE_FILTER").with_payload(json!({
            "displayForm": df, "localId": id, "index": index
        }))
    };

    assert_eq!(engine.dispatch(add("label.a", "a", -1)).await.event_type, "FILTER_CONTEXT_CHANGED");
    assert_eq!(engine.dispatch(add("label.b", "b", 0)).await.event_type, "FILTER_CONTEXT_CHANGED");

    let duplicate = engine.dispatch(add("label.a", "c", -1)).await;
    assert_eq!(
        CommandFailed::from_event(&duplicate).unwrap().reason,
        FailureReason::InvalidArguments
    );
    let out_of_range = engine.dispatch(add("label.c", "c", 7)).await;
    assert_eq!(
        CommandFailed::from_event(&out_of_range).unwrap().reason,
        FailureReason::InvalidArguments
    );

    let items = select_filter_context_items();
    let ids = |engine: &Engine<DashboardState>| -> Vec<String> {
        engine
            .select(&items)
            .iter()
            .map(|i| i.local_id.clone())
            .collect()
    };
    assert_eq!(ids(&engine), vec!["b", "a"]);

    engine
        .dispatch(Command::new("FILTER_CONTEXT_MOVE_ATTRIBUTE_FILTER").with_payload(json!({
            "filterLocalId": "b", "index": -1
        })))
        .await;
    assert_eq!(ids(&engine), vec!["a", "b"]);

    let version = engine.store().version();
    let missing = engine
        .dispatch(Command::new("FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS").with_payload(json!({
            "filterLocalIds": ["a", "zzz"]
        })))
        .await;
    assert_eq!(missing.event_type, "FILTER_CONTEXT_CHANGE_FAILED");
    assert_eq!(engine.store().version(), version);

    let removed = engine
        .dispatch(Command::new("FILTER_CONTEXT_REMOVE_ATTRIBUTE_FILTERS").with_payload(json!({
            "filterLocalIds": ["a"]
        })))
        .await;
    assert_eq!(removed.event_type, "FILTER_CONTEXT_CHANGED");
    assert_eq!(ids(&engine), vec!["b"]);
}

/// Counts fetches of a fixed value.
struct Counted {
    key: &'static str,
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl Query for Counted {
    type Output = u32;

    fn descriptor(&self) -> QueryDescriptor {
        QueryDescriptor::new("X").with_part(json!(self.key))
    }

    async fn fetch(&self, cx: &TaskContext) -> Result<u32, TaskError> {
        cx.yield_now().await?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }
}

#[tokio::test]
async fn invalidation_forces_a_new_fetch() {
    let backend = Arc::new(MockBackend::new());
    let engine = engine(&backend);
    let fetches = Arc::new(AtomicUsize::new(0));
    let query = || Counted {
        key: "a",
        fetches: Arc::clone(&fetches),
    };

    assert_eq!(engine.query(query()).await.unwrap(), 7);
    assert_eq!(engine.query(query()).await.unwrap(), 7);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    assert_eq!(engine.invalidate(|k| k == "X:a"), 1);
    assert_eq!(engine.query(query()).await.unwrap(), 7);
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

//! Shared harness for the Conflux end-to-end scenarios
//!
//! Every scenario runs a real [`ProcessEngine`] on the in-memory store with a
//! [`ManualClock`], so timers only fire when a test moves the clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use conflux_core::domain::events::{EngineEvent, EngineEventListener};
use conflux_core::{
    CoreError, DelegateInput, EngineConfig, ExecutionId, HistoryLevel, ManualClock,
    ProcessEngine, ServiceTaskDelegate, TaskId, VariableMap,
};
use conflux_state_inmemory::InMemoryEntityStore;

/// Route engine logs to the test output; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Instant every scenario starts at
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

/// Build a variable map from a JSON object literal
pub fn vars(value: serde_json::Value) -> VariableMap {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => VariableMap::new(),
    }
}

/// Collects every event the engine publishes
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingListener {
    /// Event type names in publication order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(EngineEvent::event_type)
            .collect()
    }

    /// Events concerning one process instance
    pub fn events_of(&self, process_instance_id: &ExecutionId) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.process_instance_id() == Some(process_instance_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EngineEventListener for RecordingListener {
    async fn handle_event(&self, event: &EngineEvent) -> Result<(), CoreError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Delegate remembering its inputs and answering with fixed output variables
#[derive(Default)]
pub struct RecordingDelegate {
    calls: Mutex<Vec<DelegateInput>>,
    output: VariableMap,
}

impl RecordingDelegate {
    /// Delegate returning `output` on every call
    pub fn returning(output: VariableMap) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            output,
        }
    }

    /// Inputs received so far
    pub fn calls(&self) -> Vec<DelegateInput> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceTaskDelegate for RecordingDelegate {
    async fn execute(&self, input: DelegateInput) -> Result<VariableMap, CoreError> {
        self.calls.lock().unwrap().push(input);
        Ok(self.output.clone())
    }
}

/// Delegate failing with a behavior error until it is repaired
pub struct FlakyDelegate {
    broken: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyDelegate {
    /// A delegate that fails until [`FlakyDelegate::repair`] is called
    pub fn broken() -> Self {
        Self {
            broken: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Let every further call succeed
    pub fn repair(&self) {
        self.broken.store(false, Ordering::SeqCst);
    }

    /// Calls made so far, failed or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceTaskDelegate for FlakyDelegate {
    async fn execute(&self, _input: DelegateInput) -> Result<VariableMap, CoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(CoreError::BehaviorError("payment gateway unavailable".to_string()));
        }
        Ok(VariableMap::new())
    }
}

/// Delegate throwing a BPMN error with a fixed code
pub struct ThrowingDelegate(pub &'static str);

#[async_trait]
impl ServiceTaskDelegate for ThrowingDelegate {
    async fn execute(&self, _input: DelegateInput) -> Result<VariableMap, CoreError> {
        Err(CoreError::bpmn(self.0))
    }
}

/// Engine, store, clock and listener of one scenario
pub struct TestEngine {
    pub engine: ProcessEngine,
    pub store: InMemoryEntityStore,
    pub clock: Arc<ManualClock>,
    pub listener: Arc<RecordingListener>,
}

/// Assembles a [`TestEngine`]
pub struct TestEngineBuilder {
    config: EngineConfig,
    delegates: Vec<(String, Arc<dyn ServiceTaskDelegate>)>,
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        let mut config = EngineConfig::default();
        config.history_level = HistoryLevel::Full;
        config.async_executor.lock_owner = "test-worker".to_string();
        Self {
            config,
            delegates: Vec::new(),
        }
    }
}

impl TestEngineBuilder {
    /// Record history at `level`
    pub fn history_level(mut self, level: HistoryLevel) -> Self {
        self.config.history_level = level;
        self
    }

    /// Give every new job `retries` attempts
    pub fn job_retries(mut self, retries: u32) -> Self {
        self.config.default_job_retries = retries;
        self
    }

    /// Make the config's executor wait before a failed job is retried
    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.config.async_executor.retry_wait_ms = wait.num_milliseconds() as u64;
        self
    }

    /// Poll for due jobs every `interval` once the executor is started
    pub fn poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.async_executor.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Only acquire jobs of `tenant_id`
    pub fn acquire_tenant(mut self, tenant_id: &str) -> Self {
        self.config.async_executor.tenant_id = Some(tenant_id.to_string());
        self
    }

    /// Register a delegate under `name`
    pub fn delegate(mut self, name: &str, delegate: Arc<dyn ServiceTaskDelegate>) -> Self {
        self.delegates.push((name.to_string(), delegate));
        self
    }

    /// Build the engine
    pub fn build(self) -> TestEngine {
        init_tracing();
        let store = InMemoryEntityStore::new();
        let clock = Arc::new(ManualClock::new(start_time()));
        let listener = Arc::new(RecordingListener::default());

        let mut builder = ProcessEngine::builder(Arc::new(store.clone()))
            .with_config(self.config)
            .with_clock(clock.clone())
            .with_listener(listener.clone());
        for (name, delegate) in self.delegates {
            builder = builder.with_delegate(name, delegate);
        }
        let engine = builder.build().expect("test engine configuration is valid");

        TestEngine {
            engine,
            store,
            clock,
            listener,
        }
    }
}

impl TestEngine {
    /// Builder with full history and no delegates
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    /// Engine with full history and no delegates
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Whether the process instance is still running
    pub async fn is_running(&self, process_instance_id: &ExecutionId) -> bool {
        self.engine
            .process_instance(process_instance_id)
            .await
            .expect("process instance lookup")
            .is_some()
    }

    /// Task definition keys of the open tasks of a process instance
    pub async fn open_task_keys(&self, process_instance_id: &ExecutionId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .engine
            .tasks(process_instance_id)
            .await
            .expect("task query")
            .into_iter()
            .map(|t| t.task_definition_key)
            .collect();
        keys.sort();
        keys
    }

    /// Id of the single open task with the given definition key
    pub async fn task_id(&self, process_instance_id: &ExecutionId, key: &str) -> TaskId {
        self.engine
            .tasks(process_instance_id)
            .await
            .expect("task query")
            .into_iter()
            .find(|t| t.task_definition_key == key)
            .map(|t| t.id)
            .unwrap_or_else(|| panic!("no open task {}", key))
    }

    /// Complete the open task with the given definition key
    pub async fn complete(
        &self,
        process_instance_id: &ExecutionId,
        key: &str,
        variables: VariableMap,
    ) -> Result<(), CoreError> {
        let task_id = self.task_id(process_instance_id, key).await;
        self.engine.complete_task(&task_id, variables).await
    }

    /// Activity ids of the historic activity instances of a process instance, sorted
    pub async fn visited(&self, process_instance_id: &ExecutionId) -> Vec<String> {
        let mut ids: Vec<String> = self
            .engine
            .historic_activity_instances(process_instance_id)
            .await
            .expect("history query")
            .into_iter()
            .map(|a| a.activity_id)
            .collect();
        ids.sort();
        ids
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

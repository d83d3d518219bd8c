//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use genflow::core::{
    Clock, DefinitionRegistry, ExecutorConfig, HealthPolicy, HealthTracker, ModelRegistry,
    ProviderRegistry, ProviderRouter, RetryPolicy, WorkflowDefinition, WorkflowExecutor,
};
use genflow::domain::{Capability, Model, ModelType, ProviderBinding};
use genflow::providers::{Provider, ProviderError, ProviderOutput, ProviderRequest};
use genflow::store::{MemoryStore, RunStore};

/// Provider that replays a script of results, then succeeds
pub struct ScriptedProvider {
    id: String,
    available: AtomicBool,
    script: Mutex<VecDeque<Result<ProviderOutput, ProviderError>>>,
    calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            available: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        })
    }

    /// Queue `n` request failures
    pub fn fail_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for i in 0..n {
            script.push_back(Err(ProviderError::Request(format!(
                "{} down ({})",
                self.id, i
            ))));
        }
    }

    pub fn push(&self, result: Result<ProviderOutput, ProviderError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every call take `delay`
    pub fn set_delay(&self, delay: std::time::Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Asset URI returned by the default success
    pub fn asset(&self) -> String {
        format!("{}://asset", self.id)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn generate(
        &self,
        _model: &Model,
        _capability: Capability,
        _request: &ProviderRequest,
    ) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(ProviderOutput::new(vec![self.asset()])))
    }
}

/// Clock the test moves by hand
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Image model with `(provider, unit_cost)` bindings; the first is the default
pub fn image_model(id: &str, bindings: &[(&str, u64)]) -> Model {
    Model {
        id: id.to_string(),
        model_type: ModelType::Image,
        capabilities: Vec::new(),
        default_provider: bindings[0].0.to_string(),
        fallback_providers: bindings[1..].iter().map(|(p, _)| p.to_string()).collect(),
        providers: bindings
            .iter()
            .map(|(p, cost)| {
                (
                    p.to_string(),
                    ProviderBinding {
                        endpoint: format!("{}/{}", p, id),
                        unit_cost: *cost,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn registry(models: Vec<Model>) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::from_models(models).unwrap())
}

pub fn providers(list: &[&Arc<ScriptedProvider>]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for provider in list {
        registry.register((*provider).clone());
    }
    registry
}

pub fn router(models: Vec<Model>, list: &[&Arc<ScriptedProvider>]) -> Arc<ProviderRouter> {
    Arc::new(ProviderRouter::new(
        registry(models),
        providers(list),
        Arc::new(HealthTracker::new(HealthPolicy::default())),
    ))
}

/// Retries without meaningful delay
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

/// Executor over `store` with the given workflows registered
pub fn executor_with_store(
    store: Arc<dyn RunStore>,
    router: Arc<ProviderRouter>,
    workflows: &[&str],
) -> WorkflowExecutor {
    let definitions = Arc::new(DefinitionRegistry::new());
    for yaml in workflows {
        definitions.register(WorkflowDefinition::from_yaml(yaml).unwrap());
    }

    WorkflowExecutor::new(store, definitions, router).with_config(ExecutorConfig {
        retry: fast_retry(),
    })
}

pub fn executor(router: Arc<ProviderRouter>, workflows: &[&str]) -> WorkflowExecutor {
    executor_with_store(Arc::new(MemoryStore::new()), router, workflows)
}

//! Hands a classified, context-bounded request to the execution worker and
//! guarantees every run ends with a terminal event.

pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::ContextBundle;
use crate::distributor::EventDistributor;
use crate::errors::TriggerError;
use crate::events::{EventEnvelope, ProgressEvent};
use crate::intent::ClassificationResult;

pub use worker::{HttpWorker, UnconfiguredWorker};

/// Everything a worker needs for one run. Only constructible through
/// [`ExecutionRequest::new`], which enforces that `QUESTION` requests carry
/// no file targets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    project_id: String,
    version_id: String,
    prompt: String,
    classification: ClassificationResult,
    context: ContextBundle,
}

impl ExecutionRequest {
    pub fn new(
        project_id: impl Into<String>,
        version_id: impl Into<String>,
        prompt: impl Into<String>,
        classification: ClassificationResult,
        context: ContextBundle,
    ) -> Result<Self, TriggerError> {
        if !classification.mode.mutates_files() {
            let entities = &classification.entities;
            if !entities.to_create.is_empty() || !entities.to_modify.is_empty() {
                return Err(TriggerError::QuestionWithMutation {
                    to_create: entities.to_create.len(),
                    to_modify: entities.to_modify.len(),
                });
            }
        }
        Ok(Self {
            project_id: project_id.into(),
            version_id: version_id.into(),
            prompt: prompt.into(),
            classification,
            context,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn classification(&self) -> &ClassificationResult {
        &self.classification
    }

    pub fn context(&self) -> &ContextBundle {
        &self.context
    }

    pub fn allows_file_mutation(&self) -> bool {
        self.classification.mode.mutates_files()
    }
}

/// Publishing handle given to a worker for one run.
#[derive(Clone)]
pub struct EventSink {
    distributor: Arc<EventDistributor>,
    project_id: String,
    version_id: String,
    allow_files: bool,
    terminal_sent: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(distributor: Arc<EventDistributor>, request: &ExecutionRequest) -> Self {
        Self {
            distributor,
            project_id: request.project_id.clone(),
            version_id: request.version_id.clone(),
            allow_files: request.allows_file_mutation(),
            terminal_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event for this run. File events are suppressed for
    /// requests that may not mutate files.
    pub fn emit(&self, event: ProgressEvent) -> Option<EventEnvelope> {
        if event.mutates_files() && !self.allow_files {
            warn!(
                project_id = %self.project_id,
                event_type = %event.event_type(),
                "suppressing file event for non-mutating request"
            );
            return None;
        }
        if event.is_terminal() {
            self.terminal_sent.store(true, Ordering::SeqCst);
        }
        Some(
            self.distributor
                .publish(&self.project_id, event, Some(self.version_id.clone())),
        )
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }
}

/// File-mutation permission of every run that has not finished yet, keyed by
/// project and version. Remote workers report progress over HTTP after
/// `trigger` returns, so their events are checked against this registry.
#[derive(Debug, Clone, Default)]
pub struct RunPolicies {
    runs: Arc<DashMap<(String, String), bool>>,
}

impl RunPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, project_id: &str, version_id: &str, allows_file_mutation: bool) {
        self.runs.insert(
            (project_id.to_string(), version_id.to_string()),
            allows_file_mutation,
        );
    }

    /// `None` for versions this process did not start or that have finished.
    pub fn allows_file_mutation(&self, project_id: &str, version_id: &str) -> Option<bool> {
        self.runs
            .get(&(project_id.to_string(), version_id.to_string()))
            .map(|allowed| *allowed)
    }

    pub fn finish(&self, project_id: &str, version_id: &str) {
        if self
            .runs
            .remove(&(project_id.to_string(), version_id.to_string()))
            .is_some()
        {
            debug!(project_id, version_id, "run policy released");
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[async_trait]
pub trait ExecutionWorker: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, events: EventSink) -> anyhow::Result<()>;

    /// Whether a successful `execute` return means the run is over. Remote
    /// workers that report progress out of band return false.
    fn completes_inline(&self) -> bool {
        true
    }
}

pub struct ExecutionTrigger {
    worker: Arc<dyn ExecutionWorker>,
    distributor: Arc<EventDistributor>,
    policies: RunPolicies,
}

impl ExecutionTrigger {
    pub fn new(worker: Arc<dyn ExecutionWorker>, distributor: Arc<EventDistributor>) -> Self {
        Self {
            worker,
            distributor,
            policies: RunPolicies::new(),
        }
    }

    pub fn policies(&self) -> &RunPolicies {
        &self.policies
    }

    /// Start the run in the background. The returned handle resolves once
    /// the worker has finished and any fallback terminal event is published.
    pub fn trigger(&self, request: ExecutionRequest) -> JoinHandle<()> {
        let sink = EventSink::new(self.distributor.clone(), &request);
        let worker = self.worker.clone();
        let completes_inline = worker.completes_inline();
        let project_id = request.project_id.clone();
        let version_id = request.version_id.clone();
        let policies = self.policies.clone();
        policies.register(&project_id, &version_id, request.allows_file_mutation());

        info!(
            project_id = %project_id,
            version_id = %version_id,
            mode = %request.classification.mode,
            "triggering execution"
        );

        tokio::spawn(async move {
            let run_sink = sink.clone();
            let outcome = tokio::spawn(async move { worker.execute(request, run_sink).await }).await;

            match outcome {
                Ok(Ok(())) => {
                    if completes_inline && !sink.terminal_sent() {
                        debug!(project_id = %project_id, "worker returned without terminal event");
                        sink.emit(ProgressEvent::Complete {
                            message: "Generation complete".to_string(),
                        });
                    }
                }
                Ok(Err(e)) => {
                    warn!(project_id = %project_id, version_id = %version_id, error = %format!("{:#}", e), "execution worker failed");
                    if !sink.terminal_sent() {
                        sink.emit(ProgressEvent::Error {
                            message: format!("{:#}", e),
                        });
                    }
                }
                Err(join_err) => {
                    warn!(project_id = %project_id, version_id = %version_id, error = %join_err, "execution worker panicked");
                    if !sink.terminal_sent() {
                        sink.emit(ProgressEvent::Error {
                            message: "Execution worker crashed".to_string(),
                        });
                    }
                }
            }

            if sink.terminal_sent() {
                policies.finish(&project_id, &version_id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamMessage;
    use crate::intent::{ClassificationSource, Entities, IterationMode};

    fn classification(mode: IterationMode, entities: Entities) -> ClassificationResult {
        ClassificationResult {
            mode,
            confidence: 0.8,
            task_list: vec!["do it".into()],
            entities,
            warnings: vec![],
            source: ClassificationSource::Rules,
        }
    }

    fn bundle() -> ContextBundle {
        ContextBundle {
            history: vec![],
            files: Default::default(),
            truncated: false,
            summary: String::new(),
        }
    }

    fn request(mode: IterationMode) -> ExecutionRequest {
        ExecutionRequest::new("P1", "v1", "prompt", classification(mode, Entities::default()), bundle())
            .unwrap()
    }

    #[test]
    fn test_question_with_targets_is_rejected() {
        let entities = Entities {
            to_modify: vec!["a.ts".into()],
            ..Entities::default()
        };
        let err = ExecutionRequest::new(
            "P1",
            "v1",
            "what?",
            classification(IterationMode::Question, entities.clone()),
            bundle(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TriggerError::QuestionWithMutation { to_create: 0, to_modify: 1 }
        ));

        assert!(
            ExecutionRequest::new(
                "P1",
                "v1",
                "change a",
                classification(IterationMode::Modify, entities),
                bundle()
            )
            .is_ok()
        );
    }

    struct Emitting(Vec<ProgressEvent>);

    #[async_trait]
    impl ExecutionWorker for Emitting {
        async fn execute(&self, _req: ExecutionRequest, events: EventSink) -> anyhow::Result<()> {
            for e in &self.0 {
                events.emit(e.clone());
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ExecutionWorker for Failing {
        async fn execute(&self, _req: ExecutionRequest, events: EventSink) -> anyhow::Result<()> {
            events.emit(ProgressEvent::StepStart { message: "Generating".into() });
            anyhow::bail!("model quota exceeded")
        }
    }

    struct Panicking;

    #[async_trait]
    impl ExecutionWorker for Panicking {
        async fn execute(&self, _req: ExecutionRequest, _events: EventSink) -> anyhow::Result<()> {
            panic!("worker bug")
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<StreamMessage>) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(StreamMessage::Event(env)) = rx.try_recv() {
            out.push(env.event);
        }
        out
    }

    #[tokio::test]
    async fn test_inline_worker_gets_fallback_complete() {
        let dist = Arc::new(EventDistributor::default());
        let (_h, mut rx) = dist.subscribe("P1");
        let trigger = ExecutionTrigger::new(
            Arc::new(Emitting(vec![ProgressEvent::StepStart { message: "s".into() }])),
            dist.clone(),
        );
        trigger.trigger(request(IterationMode::Create)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ProgressEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_no_duplicate_terminal_when_worker_completes() {
        let dist = Arc::new(EventDistributor::default());
        let (_h, mut rx) = dist.subscribe("P1");
        let trigger = ExecutionTrigger::new(
            Arc::new(Emitting(vec![ProgressEvent::Complete { message: "Done".into() }])),
            dist.clone(),
        );
        trigger.trigger(request(IterationMode::Create)).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_worker_error_becomes_error_event() {
        let dist = Arc::new(EventDistributor::default());
        let (_h, mut rx) = dist.subscribe("P1");
        let trigger = ExecutionTrigger::new(Arc::new(Failing), dist.clone());
        trigger.trigger(request(IterationMode::Modify)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::Error { message: "model quota exceeded".into() })
        );
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_error_event() {
        let dist = Arc::new(EventDistributor::default());
        let (_h, mut rx) = dist.subscribe("P1");
        let trigger = ExecutionTrigger::new(Arc::new(Panicking), dist.clone());
        trigger.trigger(request(IterationMode::Create)).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [ProgressEvent::Error { .. }]));
    }

    #[tokio::test]
    async fn test_question_run_drops_file_events() {
        let dist = Arc::new(EventDistributor::default());
        let (_h, mut rx) = dist.subscribe("P1");
        let trigger = ExecutionTrigger::new(
            Arc::new(Emitting(vec![
                ProgressEvent::FileGenerating { filename: "a.ts".into() },
                ProgressEvent::FileComplete { filename: "a.ts".into(), content: "x".into() },
                ProgressEvent::Complete { message: "Answered".into() },
            ])),
            dist.clone(),
        );
        trigger.trigger(request(IterationMode::Question)).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events, vec![ProgressEvent::Complete { message: "Answered".into() }]);
    }

    struct Detached;

    #[async_trait]
    impl ExecutionWorker for Detached {
        async fn execute(&self, _req: ExecutionRequest, events: EventSink) -> anyhow::Result<()> {
            events.emit(ProgressEvent::StepStart { message: "Queued".into() });
            Ok(())
        }

        fn completes_inline(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_policy_released_once_run_is_terminal() {
        let dist = Arc::new(EventDistributor::default());
        let trigger = ExecutionTrigger::new(Arc::new(Failing), dist);
        trigger.trigger(request(IterationMode::Modify)).await.unwrap();
        assert!(trigger.policies().is_empty());
    }

    #[tokio::test]
    async fn test_remote_run_keeps_policy_until_it_reports_terminal() {
        let dist = Arc::new(EventDistributor::default());
        let trigger = ExecutionTrigger::new(Arc::new(Detached), dist);
        trigger.trigger(request(IterationMode::Question)).await.unwrap();

        assert_eq!(trigger.policies().allows_file_mutation("P1", "v1"), Some(false));
        assert_eq!(trigger.policies().allows_file_mutation("P1", "v2"), None);
        trigger.policies().finish("P1", "v1");
        assert!(trigger.policies().is_empty());
    }
}

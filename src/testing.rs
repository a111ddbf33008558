//! Scripted capabilities for unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentObserver, AgentRequest, AgentRunner};
use crate::vcs::VersionControl;

type RunHook = Arc<dyn Fn(&AgentRequest) + Send + Sync>;

/// Replays queued responses, one per invocation, recording every request.
/// Once the queue is empty each run yields an empty final answer.
#[derive(Clone, Default)]
pub struct FakeAgent {
    responses: Arc<Mutex<VecDeque<Vec<AgentEvent>>>>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
    hook: Option<RunHook>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, events: Vec<AgentEvent>) -> Self {
        self.responses.lock().unwrap().push_back(events);
        self
    }

    /// Run `hook` at the start of every invocation (e.g. to edit files).
    pub fn on_run(mut self, hook: impl Fn(&AgentRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for FakeAgent {
    async fn run(
        &self,
        request: AgentRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<BoxStream<'static, AgentEvent>> {
        if let Some(hook) = &self.hook {
            hook(&request);
        }
        self.requests.lock().unwrap().push(request);
        let events = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![AgentEvent::FinalText(String::new())]);
        Ok(stream::iter(events).boxed())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentObserver for RecordingObserver {
    async fn on_event(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct VcsState {
    repository: bool,
    fail_reset: bool,
    changed: BTreeSet<String>,
    /// (id, message); the first entry is the pre-existing base commit
    commits: Vec<(String, String)>,
    resets: Vec<String>,
}

/// In-memory repository: `touch` marks files changed, `commit` clears them.
#[derive(Clone)]
pub struct FakeVcs {
    state: Arc<Mutex<VcsState>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(VcsState {
                repository: true,
                fail_reset: false,
                changed: BTreeSet::new(),
                commits: vec![("c0".to_string(), "base".to_string())],
                resets: Vec::new(),
            })),
        }
    }

    pub fn not_repository(self) -> Self {
        self.state.lock().unwrap().repository = false;
        self
    }

    pub fn failing_reset(self) -> Self {
        self.state.lock().unwrap().fail_reset = true;
        self
    }

    pub fn touch(&self, file: &str) {
        self.state.lock().unwrap().changed.insert(file.to_string());
    }

    /// Messages of commits made after the base commit.
    pub fn commits(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.commits.iter().skip(1).map(|(_, msg)| msg.clone()).collect()
    }

    pub fn resets(&self) -> Vec<String> {
        self.state.lock().unwrap().resets.clone()
    }
}

impl VersionControl for FakeVcs {
    fn is_repository(&self) -> bool {
        self.state.lock().unwrap().repository
    }

    fn changed_files(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.state.lock().unwrap().changed.iter().cloned().collect())
    }

    fn commit(&self, message: &str) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        let id = format!("c{}", state.commits.len());
        state.commits.push((id.clone(), message.to_string()));
        state.changed.clear();
        Ok(id)
    }

    fn hard_reset(&self, reference: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.resets.push(reference.to_string());
        if state.fail_reset {
            anyhow::bail!("reset refused");
        }
        let Some(pos) = state.commits.iter().position(|(id, _)| id == reference) else {
            anyhow::bail!("Unknown reference '{}'", reference);
        };
        state.commits.truncate(pos + 1);
        state.changed.clear();
        Ok(())
    }

    fn head(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        if !state.repository {
            return None;
        }
        state.commits.last().map(|(id, _)| id.clone())
    }
}

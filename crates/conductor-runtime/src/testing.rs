//! Shared fixtures for orchestrator tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::attachments::{AttachmentStore, FsAttachmentStore};
use crate::services::{RunLimits, RunServices};
use crate::steps::StepRuntime;
use conductor_core::{Error, ModelSettings, Result};
use conductor_llm::{
    ExecutionEngine, ModelClient, ModelRequest, ModelResponse, ScriptedModelClient, ScriptedResponse,
};
use conductor_store::{NewIssue, SqliteStore, Subscription, Workspace};

pub struct FailingAttachmentStore;

#[async_trait]
impl AttachmentStore for FailingAttachmentStore {
    async fn put(&self, _key: &str, _content: &[u8], _mime_type: &str) -> Result<()> {
        Err(Error::Attachment("bucket unavailable".into()))
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(Error::Attachment("bucket unavailable".into()))
    }
}

/// Holds every model call until the test releases it.
pub struct GatedModelClient {
    inner: Arc<ScriptedModelClient>,
    gate: Semaphore,
    entered: AtomicUsize,
}

impl GatedModelClient {
    /// Calls that have reached the gate, released or not.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    /// Wait until `calls` calls are parked at the gate.
    pub async fn wait_for(&self, calls: usize) {
        while self.entered() < calls {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ModelClient for GatedModelClient {
    fn name(&self) -> &str {
        "gated"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .forget();
        self.inner.complete(request).await
    }
}

/// Workspace `ws-1` owned by `owner-1`, parent `p-1` (MKT-1) and three
/// AI-assignable subtasks `s-1`..`s-3` (MKT-2..MKT-4) plus one manual
/// subtask `s-manual`.
pub struct Fixture {
    pub store: Arc<SqliteStore>,
    pub client: Arc<ScriptedModelClient>,
    pub services: Arc<RunServices>,
    pub runtime: StepRuntime,
    _tmp: tempfile::TempDir,
}

impl Fixture {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self::with_client(ScriptedModelClient::new(responses))
    }

    pub fn with_client(client: ScriptedModelClient) -> Self {
        let client = Arc::new(client);
        Self::build(client.clone(), client, None)
    }

    pub fn with_attachments(
        responses: Vec<ScriptedResponse>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        let client = Arc::new(ScriptedModelClient::new(responses));
        Self::build(client.clone(), client, Some(attachments))
    }

    /// Model calls block at a gate until released.
    pub fn gated(responses: Vec<ScriptedResponse>) -> (Self, Arc<GatedModelClient>) {
        let client = Arc::new(ScriptedModelClient::new(responses));
        let gated = Arc::new(GatedModelClient {
            inner: client.clone(),
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
        });
        (Self::build(client, gated.clone(), None), gated)
    }

    fn build(
        client: Arc<ScriptedModelClient>,
        model: Arc<dyn ModelClient>,
        attachments: Option<Arc<dyn AttachmentStore>>,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(tmp.path()).unwrap());
        seed(&store);

        let engine = ExecutionEngine::new(model, ModelSettings::default());
        let attachments = attachments
            .unwrap_or_else(|| Arc::new(FsAttachmentStore::new(tmp.path().join("attachments"))));
        let limits = RunLimits {
            max_attempts: 3,
            digest_chars: 1_500,
            summary_chars: 500,
        };
        let services = Arc::new(RunServices::new(store.clone(), engine, attachments, limits));
        let runtime = StepRuntime::new(store.clone(), 3).with_retry_backoff(Duration::ZERO);

        Self {
            store,
            client,
            services,
            runtime,
            _tmp: tmp,
        }
    }

    /// Drop `owner-1` to 100 tokens with auto-reload armed, so every
    /// metered call lands under the threshold.
    pub fn arm_auto_reload(&self) {
        let mut sub = Subscription::new("owner-1", 100);
        sub.auto_reload_enabled = true;
        sub.auto_reload_threshold = Some(1_000);
        sub.auto_reload_amount = Some(5_000);
        sub.max_monthly_auto_reload = Some(20_000);
        sub.payment_method_id = Some("pm_1".into());
        self.store.upsert_subscription(&sub).unwrap();
    }

    pub fn user_prompts(&self) -> Vec<String> {
        self.client
            .requests()
            .into_iter()
            .map(|r| r.user_prompt)
            .collect()
    }
}

fn seed(store: &SqliteStore) {
    store
        .insert_workspace(&Workspace {
            id: "ws-1".into(),
            owner_id: "owner-1".into(),
            name: "Acme".into(),
            persona: Some("Plain-spoken B2B marketer.".into()),
            brand_summary: Some("Acme makes anvils.".into()),
            created_at: 0,
        })
        .unwrap();
    store
        .upsert_subscription(&Subscription::new("owner-1", 1_000_000))
        .unwrap();

    store
        .insert_issue(NewIssue {
            id: "p-1".into(),
            workspace_id: "ws-1".into(),
            identifier: "MKT-1".into(),
            title: "Spring launch".into(),
            description: Some("Launch the spring anvil line.".into()),
            ..Default::default()
        })
        .unwrap();

    let subtasks = [
        ("s-1", "MKT-2", "Research competitors"),
        ("s-2", "MKT-3", "Draft landing copy"),
        ("s-3", "MKT-4", "Write launch email"),
    ];
    for (position, (id, identifier, title)) in subtasks.iter().enumerate() {
        store
            .insert_issue(NewIssue {
                id: (*id).into(),
                workspace_id: "ws-1".into(),
                parent_id: Some("p-1".into()),
                identifier: (*identifier).into(),
                title: (*title).into(),
                ai_assignable: true,
                position: position as i64,
                ..Default::default()
            })
            .unwrap();
    }
    store
        .insert_issue(NewIssue {
            id: "s-manual".into(),
            workspace_id: "ws-1".into(),
            parent_id: Some("p-1".into()),
            identifier: "MKT-5".into(),
            title: "Book photographer".into(),
            ai_assignable: false,
            position: 10,
            ..Default::default()
        })
        .unwrap();
}

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{AuditSink, TaskAuditRecord, WorkspaceAuditRecord};

/// Ships audit records as JSON to an HTTP collector. Delivery is best-effort;
/// the caller counts failures and moves on.
pub struct HttpAuditSink {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
enum Envelope<'a> {
    #[serde(rename = "workspace")]
    Workspace { record: &'a WorkspaceAuditRecord },
    #[serde(rename = "task")]
    Task { record: &'a TaskAuditRecord },
}

impl HttpAuditSink {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build audit HTTP client")?;
        Ok(Self { client, endpoint })
    }

    async fn post(&self, envelope: &Envelope<'_>) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(envelope)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;
        response
            .error_for_status()
            .with_context(|| format!("audit sink rejected record at {}", self.endpoint))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn workspace_event(&self, record: &WorkspaceAuditRecord) -> anyhow::Result<()> {
        self.post(&Envelope::Workspace { record }).await
    }

    async fn task_completion(&self, record: &TaskAuditRecord) -> anyhow::Result<()> {
        self.post(&Envelope::Task { record }).await
    }
}

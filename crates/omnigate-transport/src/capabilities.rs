//! Concurrent capability fetching.
//!
//! The four capability kinds are fetched in parallel with an individual
//! timeout each; a backend that serves tools but errors on prompts still
//! yields a usable partial outcome, with the failures recorded per kind.

use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::core::{OutboundTransport, TransportError};
use omnigate_protocol::types::{Prompt, Resource, ResourceTemplate, Tool};

/// The four capability kinds a backend can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// `tools/list`
    Tools,
    /// `prompts/list`
    Prompts,
    /// `resources/list`
    Resources,
    /// `resources/templates/list`
    ResourceTemplates,
}

impl CapabilityKind {
    /// Wire-ish name used in sync summaries and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tools => "tools",
            Self::Prompts => "prompts",
            Self::Resources => "resources",
            Self::ResourceTemplates => "resource_templates",
        }
    }
}

/// Result of one concurrent capability fetch.
#[derive(Debug, Default)]
pub struct CapabilityFetchOutcome {
    /// Tools, when that kind succeeded
    pub tools: Option<Vec<Tool>>,
    /// Prompts, when that kind succeeded
    pub prompts: Option<Vec<Prompt>>,
    /// Resources, when that kind succeeded
    pub resources: Option<Vec<Resource>>,
    /// Resource templates, when that kind succeeded
    pub resource_templates: Option<Vec<ResourceTemplate>>,
    /// Per-kind failures
    pub errors: Vec<(CapabilityKind, String)>,
}

impl CapabilityFetchOutcome {
    /// No kind succeeded.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.tools.is_none()
            && self.prompts.is_none()
            && self.resources.is_none()
            && self.resource_templates.is_none()
    }

    /// At least one kind succeeded and at least one failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() && !self.is_total_failure()
    }
}

async fn fetch_kind<T>(
    kind: CapabilityKind,
    per_kind_timeout: Duration,
    fut: impl std::future::Future<Output = Result<Vec<T>, TransportError>>,
) -> Result<Vec<T>, (CapabilityKind, String)> {
    match timeout(per_kind_timeout, fut).await {
        Ok(Ok(items)) => {
            debug!(kind = kind.as_str(), count = items.len(), "capability fetch ok");
            Ok(items)
        }
        Ok(Err(e)) => Err((kind, e.to_string())),
        Err(_) => Err((kind, format!("{} fetch timed out", kind.as_str()))),
    }
}

/// Fetch all four capability kinds concurrently.
pub async fn fetch_capabilities(
    transport: &dyn OutboundTransport,
    per_kind_timeout: Duration,
) -> CapabilityFetchOutcome {
    let (tools, prompts, resources, resource_templates) = tokio::join!(
        fetch_kind(
            CapabilityKind::Tools,
            per_kind_timeout,
            transport.fetch_tools()
        ),
        fetch_kind(
            CapabilityKind::Prompts,
            per_kind_timeout,
            transport.fetch_prompts()
        ),
        fetch_kind(
            CapabilityKind::Resources,
            per_kind_timeout,
            transport.fetch_resources()
        ),
        fetch_kind(
            CapabilityKind::ResourceTemplates,
            per_kind_timeout,
            transport.fetch_resource_templates()
        ),
    );

    let mut outcome = CapabilityFetchOutcome::default();
    match tools {
        Ok(items) => outcome.tools = Some(items),
        Err(err) => outcome.errors.push(err),
    }
    match prompts {
        Ok(items) => outcome.prompts = Some(items),
        Err(err) => outcome.errors.push(err),
    }
    match resources {
        Ok(items) => outcome.resources = Some(items),
        Err(err) => outcome.errors.push(err),
    }
    match resource_templates {
        Ok(items) => outcome.resource_templates = Some(items),
        Err(err) => outcome.errors.push(err),
    }
    outcome
}

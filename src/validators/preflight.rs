//! BP-022: Live cloud preflight checks.
//!
//! The cloud validators talk to an external API through [`CloudPreflight`].
//! Each enabled check runs as its own tokio task with its own timeout; the
//! results are joined and every failure becomes a [`Finding`].

use super::ValidatorKind;
use crate::core::error::Finding;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Client for the cloud APIs the preflight validators query.
#[async_trait]
pub trait CloudPreflight: Send + Sync {
    async fn project_exists(&self, project_id: &str) -> Result<(), String>;

    async fn apis_enabled(&self, project_id: &str, services: &[String]) -> Result<(), String>;

    async fn region_exists(&self, project_id: &str, region: &str) -> Result<(), String>;

    async fn zone_exists(&self, project_id: &str, zone: &str) -> Result<(), String>;

    async fn zone_in_region(&self, project_id: &str, zone: &str, region: &str)
        -> Result<(), String>;
}

/// One cloud validator invocation with its inputs resolved to strings.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightRequest {
    pub kind: ValidatorKind,
    pub inputs: IndexMap<String, String>,
}

impl PreflightRequest {
    fn input(&self, name: &str) -> Result<&str, String> {
        self.inputs
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| format!("input {} was not provided", name))
    }
}

async fn dispatch(
    client: &dyn CloudPreflight,
    request: &PreflightRequest,
    services: &[String],
) -> Result<(), String> {
    match request.kind {
        ValidatorKind::ProjectExists => client.project_exists(request.input("project_id")?).await,
        ValidatorKind::ApisEnabled => {
            if services.is_empty() {
                return Ok(());
            }
            client
                .apis_enabled(request.input("project_id")?, services)
                .await
        }
        ValidatorKind::RegionExists => {
            client
                .region_exists(request.input("project_id")?, request.input("region")?)
                .await
        }
        ValidatorKind::ZoneExists => {
            client
                .zone_exists(request.input("project_id")?, request.input("zone")?)
                .await
        }
        ValidatorKind::ZoneInRegion => {
            client
                .zone_in_region(
                    request.input("project_id")?,
                    request.input("zone")?,
                    request.input("region")?,
                )
                .await
        }
        ValidatorKind::ModuleNotUsed | ValidatorKind::DeploymentVariableNotUsed => Err(format!(
            "{} is not a cloud validator",
            request.kind.name()
        )),
    }
}

/// Run every request concurrently; each is bounded by `limit`.
///
/// Findings come back in request order.
pub async fn run_preflight(
    client: Arc<dyn CloudPreflight>,
    requests: Vec<PreflightRequest>,
    services: Vec<String>,
    limit: Duration,
) -> Vec<Finding> {
    let services = Arc::new(services);
    let mut tasks = JoinSet::new();
    for (idx, request) in requests.into_iter().enumerate() {
        let client = Arc::clone(&client);
        let services = Arc::clone(&services);
        tasks.spawn(async move {
            let name = request.kind.name();
            debug!(validator = name, "running preflight check");
            let outcome = match timeout(limit, dispatch(client.as_ref(), &request, &services)).await
            {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {}s", limit.as_secs_f64())),
            };
            (idx, name, outcome)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, name, Err(message))) => {
                warn!(validator = name, %message, "preflight check failed");
                results.push((
                    idx,
                    Finding::ValidatorFailed {
                        validator: name.to_string(),
                        message,
                    },
                ));
            }
            Ok((_, _, Ok(()))) => {}
            Err(e) => results.push((
                usize::MAX,
                Finding::ValidatorFailed {
                    validator: "preflight".to_string(),
                    message: format!("check aborted: {}", e),
                },
            )),
        }
    }
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, f)| f).collect()
}

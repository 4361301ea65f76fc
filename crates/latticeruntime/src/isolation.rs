use crate::dependency::DependencyResolver;
use latticecore::{Component, ComponentContext, NodeError, NodeOutput, NodeRunResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;

/// Runs one node's component outside the scheduler.
///
/// Native components run in their own task, so a panic or a hang cannot
/// reach the scheduler; process components additionally run in a child
/// process that is killed when the task is dropped.
///
/// Aborting a task only takes effect at its next `.await`. A native
/// component that blocks without yielding still times out on schedule on a
/// multi-threaded runtime, but its worker stays occupied until it returns,
/// and on a current-thread runtime it stalls the scheduler with it.
pub struct Isolator {
    resolver: Arc<DependencyResolver>,
    grace: Duration,
}

impl Isolator {
    pub fn new(resolver: Arc<DependencyResolver>, grace: Duration) -> Self {
        Self { resolver, grace }
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    /// Invoke `component` once, with one repair-and-retry cycle when the
    /// failure signature is a missing capability
    pub async fn invoke(
        &self,
        component: Arc<dyn Component>,
        ctx: ComponentContext,
        timeout: Option<Duration>,
    ) -> NodeRunResult {
        let started = Instant::now();
        let mut attempts = 1;
        let mut outcome = self.attempt(component.clone(), ctx.clone(), timeout).await;

        if let Err(NodeError::MissingCapability(detail)) = &outcome {
            let detail = detail.clone();
            ctx.events.warn(format!("Missing capability: {}", detail));
            let requirement = ctx.requirements.clone();
            outcome = match self.resolver.ensure(&requirement, &ctx.events).await {
                Err(e) => Err(NodeError::Dependency {
                    requirement,
                    detail: e.to_string(),
                }),
                Ok(report) if !report.repaired() => Err(NodeError::Dependency {
                    requirement,
                    detail: format!("nothing to install, still failing: {}", detail),
                }),
                Ok(report) => {
                    let installed: Vec<String> =
                        report.installed.iter().map(|r| r.to_string()).collect();
                    ctx.events
                        .info(format!("Installed {}; retrying", installed.join(", ")));
                    attempts += 1;
                    match self.attempt(component, ctx.clone(), timeout).await {
                        Err(NodeError::MissingCapability(detail)) => {
                            Err(NodeError::Dependency { requirement, detail })
                        }
                        other => other,
                    }
                }
            };
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut result = match outcome {
            Ok(output) => NodeRunResult::succeeded(output.outputs, elapsed_ms),
            Err(e) => {
                tracing::warn!(node_id = %ctx.node_id, "Node invocation failed: {}", e);
                NodeRunResult::failed(&e, elapsed_ms)
            }
        };
        result.attempts = attempts;
        result
    }

    async fn attempt(
        &self,
        component: Arc<dyn Component>,
        ctx: ComponentContext,
        timeout: Option<Duration>,
    ) -> Result<NodeOutput, NodeError> {
        let cancel = ctx.cancellation.clone();
        let node_id = ctx.node_id;
        let mut handle = tokio::spawn(async move { component.run(ctx).await });
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            joined = &mut handle => flatten(joined),
            _ = deadline => {
                tracing::warn!(%node_id, "Node exceeded its timeout; aborting");
                handle.abort();
                let millis = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                Err(NodeError::Timeout { millis })
            }
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.grace, &mut handle).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        tracing::warn!(%node_id, "Node ignored cancellation; terminating");
                        handle.abort();
                        Err(NodeError::Cancelled)
                    }
                }
            }
        }
    }
}

fn flatten(joined: Result<Result<NodeOutput, NodeError>, JoinError>) -> Result<NodeOutput, NodeError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(NodeError::ExecutionFailed(format!("component panicked: {}", message)))
        }
        Err(_) => Err(NodeError::Cancelled),
    }
}

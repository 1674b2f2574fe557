//! Review gate for AI-proposed command batches.

use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::chat::ToolCall;
use crate::mutation::{SceneMutation, SceneState};
use crate::project;
use crate::registry::params::{AttachScriptParams, EntityIdParams, NameParams, PathParams, WriteScriptParams};
use crate::security::{SecurityFinding, SecurityReport, Severity};
use crate::settings::{ApprovalPolicy, SecuritySettings};

/// A batch of tool calls awaiting review, with the current security report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub conversation_id: String,
    pub turn: usize,
    pub calls: Vec<ToolCall>,
    pub report: SecurityReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

impl ApprovalDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

#[async_trait]
pub trait Approver: Send + Sync {
    async fn review(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything. Used when no reviewer is attached.
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn review(&self, _request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}

pub struct DenyAll;

#[async_trait]
impl Approver for DenyAll {
    async fn review(&self, _request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::reject("All AI edits are disabled")
    }
}

/// A review request handed to a UI, with the channel to answer on.
pub type PendingApproval = (ApprovalRequest, oneshot::Sender<ApprovalDecision>);

/// Forwards requests to a reviewer over a channel and waits for the answer.
/// A reviewer that goes away counts as a rejection.
pub struct ChannelApprover {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn review(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request, reply_tx)).await.is_err() {
            return ApprovalDecision::reject("No reviewer is attached");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ApprovalDecision::reject("Reviewer dismissed the request"))
    }
}

fn args<T: DeserializeOwned>(call: &ToolCall) -> Option<T> {
    serde_json::from_value(call.input.clone()).ok()
}

/// Local state as it would look after `calls`, counting only the effects that
/// can be read off their arguments: script writes and deletes, script
/// attachment, entity deletion and document swaps. Calls that would fail are
/// skipped.
pub fn project_batch(current: &SceneState, calls: &[ToolCall]) -> SceneState {
    let mut state = current.clone();
    for call in calls {
        let mutation = match call.name.as_str() {
            "write_script" => args::<WriteScriptParams>(call).map(|p| SceneMutation::SetScript {
                name: p.name,
                source: Some(p.source),
            }),
            "delete_script" => args::<NameParams>(call).map(|p| SceneMutation::SetScript {
                name: p.name,
                source: None,
            }),
            "attach_script" => args::<AttachScriptParams>(call).map(|p| SceneMutation::AttachScript {
                id: p.entity_id,
                script: p.script,
            }),
            "delete_entity" => {
                args::<EntityIdParams>(call).map(|p| SceneMutation::DeleteEntity { id: p.entity_id })
            }
            "new_document" => {
                state = SceneState::default();
                None
            }
            "load_document" => {
                if let Some(doc) = args::<PathParams>(call)
                    .and_then(|p| project::load_document(Path::new(&p.path)).ok())
                {
                    state = SceneState {
                        scene: doc.scene,
                        scripts: doc.scripts,
                    };
                }
                None
            }
            _ => None,
        };
        if let Some(m) = mutation {
            if let Err(e) = m.apply(&mut state) {
                tracing::trace!(tool = %call.name, error = %e, "call left out of batch projection");
            }
        }
    }
    state
}

/// Findings in `after` that `before` does not already carry. A finding is
/// carried when `before` has one of the same kind and message covering at
/// least the same entities.
pub fn introduced_findings(before: &SecurityReport, after: &SecurityReport) -> SecurityReport {
    let carried = |finding: &SecurityFinding| {
        before.issues.iter().any(|old| {
            old.issue_kind == finding.issue_kind
                && old.message == finding.message
                && finding
                    .affected_entity_ids
                    .iter()
                    .all(|id| old.affected_entity_ids.contains(id))
        })
    };
    let issues: Vec<SecurityFinding> = after.issues.iter().filter(|f| !carried(f)).cloned().collect();
    SecurityReport {
        healthy: !issues.iter().any(|i| i.severity >= Severity::Error),
        issues,
        stats: after.stats.clone(),
    }
}

/// Apply the configured block policy to a report. Returns the rejection
/// reason when the batch must be refused without consulting the reviewer.
pub fn blocking_reason(report: &SecurityReport, settings: &SecuritySettings) -> Option<String> {
    let blocking: Vec<&str> = match settings.block_policy {
        ApprovalPolicy::Advisory => return None,
        ApprovalPolicy::BlockOnCritical => report
            .issues
            .iter()
            .filter(|i| settings.critical_kinds.contains(&i.issue_kind))
            .map(|i| i.issue_kind.as_str())
            .collect(),
        ApprovalPolicy::BlockOnAny => report.issues.iter().map(|i| i.issue_kind.as_str()).collect(),
    };
    if blocking.is_empty() {
        return None;
    }
    let mut kinds = blocking;
    kinds.sort_unstable();
    kinds.dedup();
    Some(format!("Blocked by security policy: {}", kinds.join(", ")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::security::{IssueKind, SecurityFinding, SecurityStats, Severity};

    fn report(kinds: &[(IssueKind, Severity)]) -> SecurityReport {
        SecurityReport {
            healthy: kinds.iter().all(|(_, s)| *s < Severity::Error),
            issues: kinds
                .iter()
                .map(|(k, s)| SecurityFinding {
                    issue_kind: *k,
                    severity: *s,
                    affected_entity_ids: vec![],
                    message: String::new(),
                })
                .collect(),
            stats: SecurityStats::default(),
        }
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            conversation_id: "c".into(),
            turn: 1,
            calls: vec![],
            report: report(&[]),
        }
    }

    #[test]
    fn block_on_critical_only_blocks_critical_kinds() {
        let settings = SecuritySettings::default();
        let warn = report(&[(IssueKind::MissingScript, Severity::Warning)]);
        assert_eq!(blocking_reason(&warn, &settings), None);

        let bad = report(&[(IssueKind::DisallowedApi, Severity::Critical)]);
        let reason = blocking_reason(&bad, &settings).unwrap();
        assert!(reason.contains("disallowed_api"));
    }

    #[test]
    fn advisory_never_blocks_and_block_on_any_always_does() {
        let bad = report(&[(IssueKind::DisallowedApi, Severity::Critical)]);
        let advisory = SecuritySettings {
            block_policy: ApprovalPolicy::Advisory,
            ..SecuritySettings::default()
        };
        assert_eq!(blocking_reason(&bad, &advisory), None);

        let strict = SecuritySettings {
            block_policy: ApprovalPolicy::BlockOnAny,
            ..SecuritySettings::default()
        };
        let warn = report(&[(IssueKind::OversizedScript, Severity::Warning)]);
        assert!(blocking_reason(&warn, &strict).is_some());
        assert_eq!(blocking_reason(&report(&[]), &strict), None);
    }

    fn finding(kind: IssueKind, message: &str, ids: &[&str]) -> SecurityFinding {
        SecurityFinding {
            issue_kind: kind,
            severity: Severity::Critical,
            affected_entity_ids: ids.iter().map(ToString::to_string).collect(),
            message: message.into(),
        }
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "t".into(),
            name: name.into(),
            input,
        }
    }

    fn with_report(issues: Vec<SecurityFinding>) -> SecurityReport {
        SecurityReport {
            healthy: issues.is_empty(),
            issues,
            stats: SecurityStats::default(),
        }
    }

    #[test]
    fn existing_findings_are_not_introduced() {
        let before = with_report(vec![finding(IssueKind::DisallowedApi, "hack", &["e1", "e2"])]);
        let fewer = with_report(vec![finding(IssueKind::DisallowedApi, "hack", &["e1"])]);
        assert!(introduced_findings(&before, &fewer).issues.is_empty());

        let spread = with_report(vec![finding(IssueKind::DisallowedApi, "hack", &["e1", "e3"])]);
        assert_eq!(introduced_findings(&before, &spread).issues.len(), 1);

        let other = with_report(vec![finding(IssueKind::DisallowedApi, "other", &[])]);
        let introduced = introduced_findings(&before, &other);
        assert!(!introduced.healthy);
        assert!(blocking_reason(&introduced, &SecuritySettings::default()).is_some());
    }

    #[test]
    fn projection_follows_script_edits() {
        let mut current = SceneState::default();
        current.scripts.insert("hack".into(), "eval(x)".into());
        let projected = project_batch(
            &current,
            &[
                call("delete_script", serde_json::json!({ "name": "hack" })),
                call("write_script", serde_json::json!({ "name": "net", "source": "fetch(u)" })),
                call("delete_script", serde_json::json!({ "name": "missing" })),
                call("rename_entity", serde_json::json!({ "entityId": "e1", "name": "X" })),
            ],
        );
        assert!(!projected.scripts.contains_key("hack"));
        assert_eq!(projected.scripts["net"], "fetch(u)");
        assert_eq!(current.scripts.len(), 1);
    }

    #[tokio::test]
    async fn channel_approver_round_trip() {
        let (approver, mut rx) = ChannelApprover::new(1);
        let reviewer = tokio::spawn(async move {
            let (req, reply) = rx.recv().await.unwrap();
            assert_eq!(req.turn, 1);
            reply.send(ApprovalDecision::reject("not now")).unwrap();
        });
        let decision = approver.review(request()).await;
        reviewer.await.unwrap();
        assert_eq!(decision, ApprovalDecision::reject("not now"));
    }

    #[tokio::test]
    async fn missing_reviewer_rejects() {
        let (approver, rx) = ChannelApprover::new(1);
        drop(rx);
        assert!(!approver.review(request()).await.is_approved());
        assert!(AutoApprove.review(request()).await.is_approved());
        assert!(!DenyAll.review(request()).await.is_approved());
    }
}

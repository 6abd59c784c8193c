//! Integrity gate stage: the deterministic checkpoint before execution.
//!
//! Pure: the checks run in-process in well under a millisecond. A
//! rejection writes the remediation into `critic_feedback` so the
//! worker's next prompt carries it verbatim, and never advances the
//! iteration counter.

use async_trait::async_trait;

use super::StageServices;
use crate::gate::{run_gate, GateConfig, GateInput};
use crate::graph::{Stage, StageContext, StageError};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::types::{FailureKind, StageKind, StageOutcome};

pub struct GateStage {
    config: GateConfig,
}

impl GateStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        let settings = &services.settings;
        Self {
            config: GateConfig {
                target_workspace: settings.target_workspace.clone(),
                max_code_chars: settings.max_code_chars,
                max_patch_file_chars: settings.max_patch_file_chars,
                path_denylist: settings.path_denylist.clone(),
                trusted_packages: settings.trusted_packages.clone(),
                experiment_max_commands: settings.experiment_max_commands,
                evidence_command_allowlist: settings.evidence_command_allowlist.clone(),
            },
        }
    }
}

#[async_trait]
impl Stage for GateStage {
    fn kind(&self) -> StageKind {
        StageKind::IntegrityGate
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        let input = GateInput {
            code: &state.generated_code,
            language: &state.target_language,
            patch_ops: &state.patch_ops,
            files_touched: &state.files_touched,
            unified_diff: state.unified_diff.as_deref(),
            experiment_plan: state.experiment_plan.as_ref(),
            touched_files: &state.touched_files,
            revision_constraints: state.revision_constraints.as_ref(),
        };

        match run_gate(&input, &self.config) {
            Ok(()) => {
                ctx.emit("pass", "all integrity checks passed");
                Ok(StageUpdate {
                    integrity_passed: Some(Some(true)),
                    integrity_failure: Some(None),
                    ..Default::default()
                }
                .with_trace(NodeTrace::new(
                    StageKind::IntegrityGate,
                    StageOutcome::Success,
                    "all integrity checks passed",
                    1.0,
                )))
            }
            Err(failure) => {
                tracing::warn!(
                    category = failure.category.as_str(),
                    evidence = %failure.evidence,
                    "integrity check failed"
                );
                ctx.emit("reject", failure.category.as_str());
                let evidence_head: String = failure.evidence.chars().take(80).collect();
                Ok(StageUpdate {
                    integrity_passed: Some(Some(false)),
                    critic_feedback: Some(failure.remediation.clone()),
                    failure_kind: Some(Some(FailureKind::IntegrityGate)),
                    integrity_failure: Some(Some(failure)),
                    ..Default::default()
                }
                .with_trace(NodeTrace::new(
                    StageKind::IntegrityGate,
                    StageOutcome::NeedsRevision,
                    format!("integrity check failed: {evidence_head}"),
                    1.0,
                )))
            }
        }
    }
}

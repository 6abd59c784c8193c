//! Analyzer stage: deep static analysis through the gateway.
//!
//! Each language engine sits behind its own circuit breaker; an open
//! breaker degrades the stage to a skip rather than stalling the
//! traversal. Every run consumes one unit of the analyzer-call budget.

use async_trait::async_trait;
use uuid::Uuid;

use super::StageServices;
use crate::clients::language_extension;
use crate::graph::{Stage, StageContext, StageError};
use crate::state::{NodeTrace, RequestState, StageUpdate};
use crate::types::{StageKind, StageOutcome};

pub struct AnalyzerStage {
    services: StageServices,
}

impl AnalyzerStage {
    #[must_use]
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Stage for AnalyzerStage {
    fn kind(&self) -> StageKind {
        StageKind::Analyzer
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(self.services.settings.analysis_timeout + std::time::Duration::from_secs(5))
    }

    async fn run(
        &self,
        state: &RequestState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, StageError> {
        let settings = &self.services.settings;
        if state.budgets.lsp_calls_used >= settings.max_lsp_calls {
            return Ok(StageUpdate::new().with_trace(NodeTrace::new(
                StageKind::Analyzer,
                StageOutcome::Success,
                "analyzer budget exhausted, skipping",
                1.0,
            )));
        }
        if state.generated_code.trim().is_empty() {
            return Ok(StageUpdate::new().with_trace(NodeTrace::new(
                StageKind::Analyzer,
                StageOutcome::Success,
                "no code to analyze",
                1.0,
            )));
        }

        let language = state.target_language.clone();
        let breaker = self
            .services
            .breakers
            .breaker(&format!("analyzer:{language}"));
        if !breaker.allow_request() {
            ctx.emit("skip", "analyzer breaker open");
            return Ok(StageUpdate {
                lsp_calls_used: Some(state.budgets.lsp_calls_used + 1),
                ..Default::default()
            }
            .with_trace(NodeTrace::new(
                StageKind::Analyzer,
                StageOutcome::Success,
                "circuit breaker open, analysis skipped",
                0.5,
            )));
        }

        ctx.emit("enter", "running deep static analysis");
        let filename = format!("script.{}", language_extension(&language));
        let request_id = Uuid::new_v4().to_string();
        let report = self
            .services
            .analysis
            .analyze(&language, &state.generated_code, Some(&filename), &request_id)
            .await;

        let mut update = StageUpdate {
            lsp_calls_used: Some(state.budgets.lsp_calls_used + 1),
            ..Default::default()
        };
        match report {
            Ok(report) => {
                breaker.record_success();
                let diagnostics: Vec<String> = report
                    .diagnostics
                    .iter()
                    .map(|d| {
                        format!(
                            "{}:{}:{} [{}] {}",
                            d.severity, d.line, d.column, d.rule, d.message
                        )
                    })
                    .collect();
                let count = diagnostics.len();
                update.lsp_diagnostics = Some(diagnostics);
                let reasoning = if report.skipped {
                    "analysis skipped by gateway".to_string()
                } else {
                    format!("{count} diagnostics from {}", report.engine)
                };
                Ok(update.with_trace(NodeTrace::new(
                    StageKind::Analyzer,
                    StageOutcome::Success,
                    reasoning,
                    1.0,
                )))
            }
            Err(err) => {
                breaker.record_failure();
                tracing::warn!(%err, "analysis gateway failed, degrading to skip");
                Ok(update.with_trace(NodeTrace::new(
                    StageKind::Analyzer,
                    StageOutcome::Error,
                    format!("analysis unavailable: {err}"),
                    0.0,
                )))
            }
        }
    }
}

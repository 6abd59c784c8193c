//! YAML-driven complexity scoring engine.
//!
//! Deterministic, no model calls: pre-compiled per-category keyword
//! patterns accumulate weight, ordered keyword pairings add risk
//! multipliers and attribute domains, a density tax penalises requests
//! touching many categories at once, and an educational discount rewards
//! informational queries. Overrides short-circuit scoring entirely.

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

use crate::types::{InteractionMode, TaskSize};

/// Score assigned when a manual override saturates the classifier.
pub const SATURATED_SCORE: i64 = 99;

/// One scored keyword category.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Category {
    pub weight: i64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// An ordered keyword tuple that must all match: adds weight and can
/// disambiguate a domain (`cluster + pod → kubernetes`,
/// `cluster + patient → healthcare`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Pairing {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub extra_weight: i64,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Trigger lists for classification overrides.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub force_manual: Vec<String>,
    #[serde(default)]
    pub force_teach: Vec<String>,
    #[serde(default)]
    pub force_pro_advanced: Vec<String>,
}

/// Score-to-size thresholds and scoring modifiers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub trivial_max: i64,
    pub small_max: i64,
    pub density_threshold: usize,
    pub density_tax: i64,
    pub educational_discount: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            trivial_max: 4,
            small_max: 15,
            density_threshold: 3,
            density_tax: 10,
            educational_discount: 10,
        }
    }
}

/// The full weights document, core or plugin.
///
/// `BTreeMap` keeps category iteration deterministic across loads.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WeightsConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub weights: BTreeMap<String, Category>,
    #[serde(default)]
    pub pairings: Vec<Pairing>,
    #[serde(default)]
    pub overrides: Overrides,
}

/// Built-in minimal table used when no YAML is available or it fails to
/// parse. Keeps trivial/small/complex working; the classifier never fails
/// a request.
#[must_use]
pub fn builtin_fallback() -> WeightsConfig {
    let mut weights = BTreeMap::new();
    weights.insert(
        "io_basic".into(),
        Category {
            weight: 1,
            keywords: vec!["print".into(), "hello".into()],
            domain: None,
        },
    );
    weights.insert(
        "logic_basic".into(),
        Category {
            weight: 2,
            keywords: vec!["basic".into(), "simple".into()],
            domain: None,
        },
    );
    weights.insert(
        "data_processing".into(),
        Category {
            weight: 5,
            keywords: vec!["parse".into(), "json".into(), "api".into()],
            domain: None,
        },
    );
    weights.insert(
        "infrastructure".into(),
        Category {
            weight: 15,
            keywords: vec!["deploy".into(), "docker".into(), "kubernetes".into()],
            domain: None,
        },
    );
    WeightsConfig {
        thresholds: Thresholds::default(),
        weights,
        pairings: Vec::new(),
        overrides: Overrides {
            force_manual: vec![
                "[STRICT]".into(),
                "/plan".into(),
                "/manual".into(),
                "/strict".into(),
                "@plan".into(),
            ],
            force_teach: vec![
                "explain".into(),
                "teach".into(),
                "how does it work".into(),
                "why".into(),
            ],
            force_pro_advanced: vec!["plan first".into(), "break it down".into()],
        },
    }
}

/// Result of scoring one request.
#[derive(Clone, Debug)]
pub struct ScoreAnalysis {
    pub task_size: TaskSize,
    pub score: i64,
    pub manual_override: bool,
    pub interaction_mode: InteractionMode,
    pub force_pro_advanced: bool,
    pub classification_hits: Vec<String>,
    pub categories_touched: Vec<String>,
    pub active_domains: Vec<String>,
}

struct CompiledCategory {
    name: String,
    weight: i64,
    pattern: Regex,
    domain: Option<String>,
}

/// The compiled scoring engine.
pub struct ScoringEngine {
    categories: Vec<CompiledCategory>,
    pairings: Vec<Pairing>,
    overrides: Overrides,
    thresholds: Thresholds,
}

const SCAN_CAP: usize = 800;

impl ScoringEngine {
    /// Compile the engine from a merged configuration. Categories whose
    /// keyword lists produce an invalid pattern are skipped with a warning.
    #[must_use]
    pub fn new(config: WeightsConfig) -> Self {
        let mut categories = Vec::with_capacity(config.weights.len());
        for (name, category) in &config.weights {
            if category.keywords.is_empty() {
                continue;
            }
            let escaped: Vec<String> = category
                .keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect();
            let source = format!(r"(?i)\b({})\b", escaped.join("|"));
            match Regex::new(&source) {
                Ok(pattern) => categories.push(CompiledCategory {
                    name: name.clone(),
                    weight: category.weight,
                    pattern,
                    domain: category.domain.clone(),
                }),
                Err(err) => warn!(category = %name, %err, "skipping uncompilable category"),
            }
        }
        Self {
            categories,
            pairings: config.pairings,
            overrides: config.overrides,
            thresholds: config.thresholds,
        }
    }

    /// Score `text` into an [`ScoreAnalysis`].
    #[must_use]
    pub fn analyze(&self, text: &str) -> ScoreAnalysis {
        let t: String = text.trim().chars().take(SCAN_CAP).collect();
        if t.is_empty() {
            return ScoreAnalysis {
                task_size: TaskSize::Small,
                score: 0,
                manual_override: false,
                interaction_mode: InteractionMode::Do,
                force_pro_advanced: false,
                classification_hits: Vec::new(),
                categories_touched: Vec::new(),
                active_domains: Vec::new(),
            };
        }

        // Manual override wins over everything: route through the
        // supervisor with a saturated score.
        if self.matches_override(&t, &self.overrides.force_manual) {
            let teach = self.matches_override(&t, &self.overrides.force_teach);
            return ScoreAnalysis {
                task_size: TaskSize::Complex,
                score: SATURATED_SCORE,
                manual_override: true,
                interaction_mode: if teach {
                    InteractionMode::Teach
                } else {
                    InteractionMode::Do
                },
                force_pro_advanced: true,
                classification_hits: vec!["force_manual".into()],
                categories_touched: Vec::new(),
                active_domains: Vec::new(),
            };
        }

        let interaction_mode = if self.matches_override(&t, &self.overrides.force_teach) {
            InteractionMode::Teach
        } else {
            InteractionMode::Do
        };
        let force_pro_advanced = self.matches_override(&t, &self.overrides.force_pro_advanced);

        let lower = t.to_lowercase();
        let mut score = 0i64;
        let mut hits = Vec::new();
        let mut categories_touched = Vec::new();
        let mut active_domains: Vec<String> = Vec::new();

        for category in &self.categories {
            if category.pattern.is_match(&lower) {
                score += category.weight;
                hits.push(format!("{}(+{})", category.name, category.weight));
                categories_touched.push(category.name.clone());
                if let Some(domain) = &category.domain {
                    if !active_domains.contains(domain) {
                        active_domains.push(domain.clone());
                    }
                }
            }
        }

        for pairing in &self.pairings {
            if pairing.keywords.is_empty() {
                continue;
            }
            let all_match = pairing.keywords.iter().all(|k| {
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k)))
                    .map(|p| p.is_match(&lower))
                    .unwrap_or(false)
            });
            if !all_match {
                continue;
            }
            if pairing.extra_weight != 0 {
                score += pairing.extra_weight;
                hits.push(format!(
                    "pairing({:?})(+{})",
                    pairing.keywords, pairing.extra_weight
                ));
            }
            if let Some(domain) = &pairing.domain {
                if !active_domains.contains(domain) {
                    active_domains.push(domain.clone());
                }
            }
        }

        if categories_touched.len() >= self.thresholds.density_threshold {
            score += self.thresholds.density_tax;
            hits.push(format!("density_tax(+{})", self.thresholds.density_tax));
        }
        if interaction_mode == InteractionMode::Teach {
            score -= self.thresholds.educational_discount;
            hits.push(format!(
                "teach_discount(-{})",
                self.thresholds.educational_discount
            ));
        }
        score = score.max(0);

        let task_size = if score <= self.thresholds.trivial_max {
            TaskSize::Trivial
        } else if score <= self.thresholds.small_max {
            TaskSize::Small
        } else {
            TaskSize::Complex
        };

        ScoreAnalysis {
            task_size,
            score,
            manual_override: false,
            interaction_mode,
            force_pro_advanced,
            classification_hits: hits,
            categories_touched,
            active_domains,
        }
    }

    fn matches_override(&self, text: &str, triggers: &[String]) -> bool {
        let lower = text.to_lowercase();
        for trigger in triggers {
            let trigger = trigger.trim();
            if trigger.is_empty() {
                continue;
            }
            let trigger_lower = trigger.to_lowercase();
            // Command-like triggers match at the start or embedded.
            if trigger.starts_with(['/', '@', '#']) {
                if lower.starts_with(&trigger_lower) || lower.contains(&trigger_lower) {
                    return true;
                }
            } else if lower.contains(&trigger_lower) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ScoringEngine {
        ScoringEngine::new(builtin_fallback())
    }

    #[test]
    fn hello_world_is_trivial() {
        let analysis = engine().analyze("hello world in python");
        assert_eq!(analysis.task_size, TaskSize::Trivial);
        assert!(!analysis.manual_override);
    }

    #[test]
    fn infrastructure_keywords_escalate() {
        let analysis = engine().analyze("deploy a docker api with kubernetes and parse json");
        assert_eq!(analysis.task_size, TaskSize::Complex);
    }

    #[test]
    fn force_manual_saturates() {
        let analysis = engine().analyze("[STRICT] rename a variable");
        assert!(analysis.manual_override);
        assert_eq!(analysis.score, SATURATED_SCORE);
        assert_eq!(analysis.task_size, TaskSize::Complex);
    }

    #[test]
    fn slash_plan_matches_embedded() {
        let analysis = engine().analyze("hello /plan the refactor");
        assert!(analysis.manual_override);
    }

    #[test]
    fn teach_trigger_sets_mode_and_discount() {
        let analysis = engine().analyze("explain how to parse json");
        assert_eq!(analysis.interaction_mode, InteractionMode::Teach);
        assert!(analysis
            .classification_hits
            .iter()
            .any(|h| h.starts_with("teach_discount")));
    }

    #[test]
    fn empty_input_scores_small() {
        let analysis = engine().analyze("   ");
        assert_eq!(analysis.task_size, TaskSize::Small);
        assert_eq!(analysis.score, 0);
    }

    #[test]
    fn density_tax_applies_at_threshold() {
        let mut config = builtin_fallback();
        config.thresholds.density_threshold = 2;
        let engine = ScoringEngine::new(config);
        let analysis = engine.analyze("print a simple parse of json");
        assert!(analysis
            .classification_hits
            .iter()
            .any(|h| h.starts_with("density_tax")));
    }
}

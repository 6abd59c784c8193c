//! Plugin merge for industry weight overlays.
//!
//! Operators drop industry YAMLs into a plugins directory and the
//! classifier absorbs them at startup. Merge rules are deterministic:
//!
//! - `weights`: update by category key, later plugin wins;
//! - `pairings`: append;
//! - `overrides`: per-key list extension;
//! - `thresholds`: last-wins override.
//!
//! Plugin files are processed in sorted filename order; files named like
//! the core config are skipped. Configuration is data only; nothing
//! executable is loaded.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::engine::{builtin_fallback, WeightsConfig};

/// File names treated as core configs inside the plugin directory.
const CORE_NAMES: [&str; 2] = ["intent_weights", "entry_classifier_weights"];

/// Load a single YAML config; `None` when missing or unparseable.
fn load_yaml(path: &Path) -> Option<WeightsConfig> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str::<WeightsConfig>(&raw) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!(?path, %err, "intent weights YAML failed to parse");
            None
        }
    }
}

/// Merge `overlay` into `base` per the plugin rules.
fn merge(base: &mut WeightsConfig, overlay: WeightsConfig) {
    for (key, category) in overlay.weights {
        base.weights.insert(key, category);
    }
    base.pairings.extend(overlay.pairings);
    base.overrides
        .force_manual
        .extend(overlay.overrides.force_manual);
    base.overrides
        .force_teach
        .extend(overlay.overrides.force_teach);
    base.overrides
        .force_pro_advanced
        .extend(overlay.overrides.force_pro_advanced);
    base.thresholds = overlay.thresholds;
}

/// Load the core config and merge every plugin overlay on top.
///
/// Falls back to the built-in minimal table when the core file is missing
/// or malformed; the classifier must never fail a request over
/// configuration.
#[must_use]
pub fn load_config(core_path: Option<&Path>, plugin_dir: Option<&Path>) -> WeightsConfig {
    let mut config = core_path
        .and_then(load_yaml)
        .unwrap_or_else(|| {
            debug!("intent weights core config unavailable, using built-in fallback");
            builtin_fallback()
        });

    let Some(plugin_dir) = plugin_dir else {
        return config;
    };
    let mut plugin_files: Vec<PathBuf> = match std::fs::read_dir(plugin_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
            .filter(|p| {
                let stem = p
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                !CORE_NAMES.iter().any(|core| stem.contains(core))
            })
            .collect(),
        Err(_) => return config,
    };
    plugin_files.sort();
    for path in plugin_files {
        if let Some(overlay) = load_yaml(&path) {
            debug!(?path, "intent weights plugin merged");
            merge(&mut config, overlay);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_core_uses_builtin() {
        let config = load_config(None, None);
        assert!(config.weights.contains_key("io_basic"));
    }

    #[test]
    fn plugins_merge_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = std::fs::File::create(dir.path().join("a_first.yaml")).unwrap();
        writeln!(
            a,
            "weights:\n  healthcare:\n    weight: 20\n    keywords: [patient]\n    domain: healthcare"
        )
        .unwrap();
        let mut b = std::fs::File::create(dir.path().join("b_second.yaml")).unwrap();
        writeln!(
            b,
            "weights:\n  healthcare:\n    weight: 30\n    keywords: [patient, hipaa]\n    domain: healthcare\npairings:\n  - keywords: [cluster, patient]\n    extra_weight: 10\n    domain: healthcare"
        )
        .unwrap();

        let config = load_config(None, Some(dir.path()));
        // Later plugin wins on the shared key.
        assert_eq!(config.weights["healthcare"].weight, 30);
        assert_eq!(config.pairings.len(), 1);
    }

    #[test]
    fn core_named_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("intent_weights.yaml")).unwrap();
        writeln!(f, "weights:\n  rogue:\n    weight: 99\n    keywords: [x]").unwrap();
        let config = load_config(None, Some(dir.path()));
        assert!(!config.weights.contains_key("rogue"));
    }

    #[test]
    fn override_lists_extend_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("plug.yaml")).unwrap();
        writeln!(f, "overrides:\n  force_manual: ['[AUDIT]']").unwrap();
        let config = load_config(None, Some(dir.path()));
        assert!(config.overrides.force_manual.contains(&"[STRICT]".to_string()));
        assert!(config.overrides.force_manual.contains(&"[AUDIT]".to_string()));
    }
}

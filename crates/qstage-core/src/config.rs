//! Pipeline configuration consumed (not owned) by the compilation stages.
//!
//! Every pipeline instance carries its own snapshot through the session, so
//! two queries compiled side by side never observe each other's settings.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of fields rendered in truncated plan strings.
    pub max_to_string_fields: usize,

    /// When false, `assert_supported` accepts every analyzed plan.
    pub unsupported_operation_check: bool,

    /// Regex whose matches are scrubbed from every rendered diagnostic.
    pub redaction_pattern: Option<String>,

    /// Gate for the adaptive re-planning wrapper (first preparation rule).
    pub adaptive_enabled: bool,

    /// Target rows per shuffle partition when an adaptive plan is finalized.
    pub adaptive_advisory_partition_rows: u64,

    /// Partition count used when requirement enforcement inserts a shuffle.
    pub shuffle_partitions: usize,

    pub dynamic_pruning_enabled: bool,

    /// Gates both exchange reuse and subquery reuse.
    pub exchange_reuse_enabled: bool,

    /// Gates fusion of adjacent filter/project operators into one stage.
    pub codegen_enabled: bool,

    /// Plan table scans as columnar producers.
    pub columnar_scans: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_to_string_fields: 25,
            unsupported_operation_check: true,
            redaction_pattern: None,
            adaptive_enabled: false,
            adaptive_advisory_partition_rows: 1024,
            shuffle_partitions: 4,
            dynamic_pruning_enabled: true,
            exchange_reuse_enabled: true,
            codegen_enabled: true,
            columnar_scans: true,
        }
    }
}

impl PipelineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `QSTAGE_MAX_TO_STRING_FIELDS`: truncation limit for renderings
    /// - `QSTAGE_UNSUPPORTED_OPERATION_CHECK`: `true`/`false`
    /// - `QSTAGE_REDACTION_REGEX`: sensitive-data pattern
    /// - `QSTAGE_ADAPTIVE_ENABLED`: `true`/`false`
    /// - `QSTAGE_ADAPTIVE_ADVISORY_ROWS`: rows per coalesced partition
    /// - `QSTAGE_SHUFFLE_PARTITIONS`: shuffle partition count
    /// - `QSTAGE_DYNAMIC_PRUNING`, `QSTAGE_EXCHANGE_REUSE`, `QSTAGE_CODEGEN`,
    ///   `QSTAGE_COLUMNAR_SCANS`: `true`/`false`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<usize>("QSTAGE_MAX_TO_STRING_FIELDS") {
            cfg.max_to_string_fields = v;
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_UNSUPPORTED_OPERATION_CHECK") {
            cfg.unsupported_operation_check = v;
        }
        if let Ok(s) = std::env::var("QSTAGE_REDACTION_REGEX") {
            if !s.is_empty() {
                cfg.redaction_pattern = Some(s);
            }
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_ADAPTIVE_ENABLED") {
            cfg.adaptive_enabled = v;
        }
        if let Some(v) = env_parse::<u64>("QSTAGE_ADAPTIVE_ADVISORY_ROWS") {
            cfg.adaptive_advisory_partition_rows = v;
        }
        if let Some(v) = env_parse::<usize>("QSTAGE_SHUFFLE_PARTITIONS") {
            cfg.shuffle_partitions = v;
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_DYNAMIC_PRUNING") {
            cfg.dynamic_pruning_enabled = v;
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_EXCHANGE_REUSE") {
            cfg.exchange_reuse_enabled = v;
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_CODEGEN") {
            cfg.codegen_enabled = v;
        }
        if let Some(v) = env_parse::<bool>("QSTAGE_COLUMNAR_SCANS") {
            cfg.columnar_scans = v;
        }

        cfg
    }

    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.shuffle_partitions == 0 {
            return Err(Error::Config("shuffle_partitions must be at least 1".into()));
        }
        if self.max_to_string_fields == 0 {
            return Err(Error::Config(
                "max_to_string_fields must be at least 1".into(),
            ));
        }
        self.redaction_regex().map(|_| ())
    }

    /// Compile the configured redaction pattern, if any.
    pub fn redaction_regex(&self) -> Result<Option<Regex>> {
        match self.redaction_pattern.as_deref() {
            None => Ok(None),
            Some(p) => Regex::new(p)
                .map(Some)
                .map_err(|e| Error::Config(format!("invalid redaction pattern '{p}': {e}"))),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn bad_redaction_pattern_is_config_error() {
        let cfg = PipelineConfig {
            redaction_pattern: Some("(unclosed".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_shuffle_partitions_rejected() {
        let cfg = PipelineConfig {
            shuffle_partitions: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_yaml_like_json_keeps_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"adaptive_enabled": true}"#).expect("parse");
        assert!(cfg.adaptive_enabled);
        assert_eq!(cfg.shuffle_partitions, 4);
    }
}

//! Explicit per-query context.
//!
//! A `Session` bundles the configuration snapshot, the catalog and every
//! collaborator a pipeline talks to. Pipelines hold an `Arc<Session>`; there
//! is no process-wide active session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;

use qstage_core::catalog::Catalog;
use qstage_core::config::PipelineConfig;
use qstage_core::error::{Error, Result};
use qstage_core::logical::LogicalPlan;
use qstage_exec::runtime::{Engine, ExecutionRuntime};
use qstage_planner::traits::{Analyzer, CacheEngine, Optimizer, QueryPlanner};
use qstage_planner::{CacheManager, CatalogAnalyzer, RuleOptimizer, RulePlanner};

use crate::pipeline::CompilationPipeline;
use crate::prepare::PreparationChain;

/// Replacement text for redacted matches.
pub const REDACTED: &str = "*********(redacted)";

/// Shared cooperative cancellation flag. Stages check it before producing.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Session {
    config: PipelineConfig,
    catalog: Arc<Catalog>,
    analyzer: Arc<dyn Analyzer>,
    cache: Arc<dyn CacheEngine>,
    optimizer: Arc<dyn Optimizer>,
    planner: Arc<dyn QueryPlanner>,
    runtime: Arc<dyn ExecutionRuntime>,
    preparation: PreparationChain,
    query_stage: PreparationChain,
    redaction: Option<Regex>,
    cancel: CancelFlag,
}

impl Session {
    pub fn builder(catalog: Arc<Catalog>) -> SessionBuilder {
        SessionBuilder::new(catalog)
    }

    /// Session with default collaborators over `catalog`.
    pub fn new(catalog: Arc<Catalog>, config: PipelineConfig) -> Result<Arc<Session>> {
        SessionBuilder::new(catalog).config(config).build()
    }

    /// Start compiling `logical`.
    pub fn pipeline(self: &Arc<Self>, logical: LogicalPlan) -> CompilationPipeline {
        CompilationPipeline::new(Arc::clone(self), logical)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn analyzer(&self) -> &dyn Analyzer {
        self.analyzer.as_ref()
    }

    pub fn cache(&self) -> &dyn CacheEngine {
        self.cache.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn planner(&self) -> &dyn QueryPlanner {
        self.planner.as_ref()
    }

    pub fn runtime(&self) -> &dyn ExecutionRuntime {
        self.runtime.as_ref()
    }

    /// Rules applied by `executed_plan()`.
    pub fn preparation_chain(&self) -> &PreparationChain {
        &self.preparation
    }

    /// Rules applied when an adaptive plan is finalized.
    pub fn query_stage_chain(&self) -> &PreparationChain {
        &self.query_stage
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub(crate) fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{stage} was cancelled")));
        }
        Ok(())
    }

    /// Scrub every match of the configured sensitive-data pattern.
    pub fn redact(&self, text: &str) -> String {
        match &self.redaction {
            Some(re) => re.replace_all(text, REDACTED).into_owned(),
            None => text.to_string(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tables", &self.catalog.table_names())
            .field("preparation", &self.preparation.rule_names())
            .finish_non_exhaustive()
    }
}

/// Builds a [`Session`]; every collaborator defaults to the in-tree
/// implementation.
pub struct SessionBuilder {
    config: PipelineConfig,
    catalog: Arc<Catalog>,
    analyzer: Option<Arc<dyn Analyzer>>,
    cache: Option<Arc<dyn CacheEngine>>,
    optimizer: Option<Arc<dyn Optimizer>>,
    planner: Option<Arc<dyn QueryPlanner>>,
    runtime: Option<Arc<dyn ExecutionRuntime>>,
    preparation: Option<PreparationChain>,
    cancel: CancelFlag,
}

impl SessionBuilder {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            config: PipelineConfig::default(),
            catalog,
            analyzer: None,
            cache: None,
            optimizer: None,
            planner: None,
            runtime: None,
            preparation: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheEngine>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn optimizer(mut self, optimizer: Arc<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ExecutionRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Replace the preparation chain used by `executed_plan()`.
    pub fn preparation_chain(mut self, chain: PreparationChain) -> Self {
        self.preparation = Some(chain);
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration and assemble the session.
    pub fn build(self) -> Result<Arc<Session>> {
        self.config.validate()?;
        let redaction = self.config.redaction_regex()?;
        let catalog = self.catalog;
        Ok(Arc::new(Session {
            analyzer: self
                .analyzer
                .unwrap_or_else(|| Arc::new(CatalogAnalyzer::new(Arc::clone(&catalog)))),
            cache: self.cache.unwrap_or_else(|| Arc::new(CacheManager::new())),
            optimizer: self.optimizer.unwrap_or_else(|| Arc::new(RuleOptimizer::new())),
            planner: self.planner.unwrap_or_else(|| Arc::new(RulePlanner::new())),
            runtime: self
                .runtime
                .unwrap_or_else(|| Arc::new(Engine::new(Arc::clone(&catalog)))),
            preparation: self.preparation.unwrap_or_else(PreparationChain::default_chain),
            query_stage: PreparationChain::query_stage_chain(),
            redaction,
            cancel: self.cancel,
            config: self.config,
            catalog,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_configured_pattern() {
        let config = PipelineConfig {
            redaction_pattern: Some("secret-[0-9]+".into()),
            ..Default::default()
        };
        let session = Session::new(Arc::new(Catalog::new()), config).expect("session");
        assert_eq!(
            session.redact("key=secret-42;"),
            format!("key={REDACTED};")
        );
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let config = PipelineConfig {
            redaction_pattern: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(
            Session::new(Arc::new(Catalog::new()), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let session = Session::builder(Arc::new(Catalog::new()))
            .cancel_flag(flag.clone())
            .build()
            .expect("session");
        flag.cancel();
        assert!(session.check_cancelled("analysis").is_err());
        flag.reset();
        assert!(session.check_cancelled("analysis").is_ok());
    }
}

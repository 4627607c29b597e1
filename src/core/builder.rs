//! 构建器：由配置与外部协作方组装整条流水线
//!
//! 必需协作方缺失、操作重名都是启动期致命错误；运行期错误只会变成观察数据。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::{AgentError, FallbackAdmission, Orchestrator};
use crate::fallback::LiveFetcher;
use crate::llm::LlmClient;
use crate::react::{Controller, ExecutionLoop, LlmController, LlmTextGenerator, LoopEvent, TextGenerator};
use crate::resolver::IdentifierResolver;
use crate::scope::{Classifier, DataScopeGate, LlmClassifier, ScopeRules, TextScopeGate};
use crate::session::SessionStore;
use crate::store::{SimilarityStore, StructuredStore};
use crate::tools::{
    CheckCompatibilityOp, FetchPartLiveOp, GetCompatibleModelsOp, GetCompatiblePartsOp, GetPartOp,
    GetRepairInstructionsOp, GetSymptomsOp, OperationExecutor, OperationRegistry, ResolveModelOp, ResolvePartOp,
    SearchPartsOp, SearchPartsSemanticOp, SearchQnaOp, SearchRepairStoriesOp, SearchReviewsOp,
};

/// 注册全部数据操作；fallback 为 None 时不注册实时抓取（回退机制随之关闭）
pub fn bootstrap_registry(
    store: Arc<dyn StructuredStore>,
    similarity: Arc<dyn SimilarityStore>,
    fallback: Option<(Arc<dyn LiveFetcher>, FallbackAdmission)>,
) -> Result<OperationRegistry, AgentError> {
    let resolver = Arc::new(IdentifierResolver::new(store.clone()));
    let mut registry = OperationRegistry::new();

    registry.add(ResolvePartOp::new(resolver.clone()))?;
    registry.add(ResolveModelOp::new(resolver))?;

    registry.add(GetPartOp::new(store.clone()))?;
    registry.add(CheckCompatibilityOp::new(store.clone()))?;
    registry.add(GetCompatiblePartsOp::new(store.clone()))?;
    registry.add(GetCompatibleModelsOp::new(store.clone()))?;
    registry.add(GetSymptomsOp::new(store.clone()))?;
    registry.add(GetRepairInstructionsOp::new(store.clone()))?;

    registry.add(SearchPartsOp::new(store))?;
    registry.add(SearchPartsSemanticOp::new(similarity.clone()))?;
    registry.add(SearchQnaOp::new(similarity.clone()))?;
    registry.add(SearchRepairStoriesOp::new(similarity.clone()))?;
    registry.add(SearchReviewsOp::new(similarity))?;

    if let Some((fetcher, admission)) = fallback {
        registry.add(FetchPartLiveOp::new(fetcher, admission))?;
    }

    tracing::info!(operations = registry.len(), "operation registry ready");
    Ok(registry)
}

/// 流水线构建器：协作方可逐个注入，未注入的 LLM 类协作方由 `with_llm` 的客户端补齐
pub struct AgentBuilder {
    config: AppConfig,
    store: Option<Arc<dyn StructuredStore>>,
    similarity: Option<Arc<dyn SimilarityStore>>,
    llm: Option<Arc<dyn LlmClient>>,
    classifier_llm: Option<Arc<dyn LlmClient>>,
    classifier: Option<Arc<dyn Classifier>>,
    controller: Option<Arc<dyn Controller>>,
    generator: Option<Arc<dyn TextGenerator>>,
    fetcher: Option<Arc<dyn LiveFetcher>>,
    rules: Option<ScopeRules>,
    event_tx: Option<UnboundedSender<LoopEvent>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            similarity: None,
            llm: None,
            classifier_llm: None,
            classifier: None,
            controller: None,
            generator: None,
            fetcher: None,
            rules: None,
            event_tx: None,
        }
    }

    /// 同一个目录同时充当结构化存储与相似度存储
    pub fn with_catalog<C>(mut self, catalog: Arc<C>) -> Self
    where
        C: StructuredStore + SimilarityStore + 'static,
    {
        self.store = Some(catalog.clone() as Arc<dyn StructuredStore>);
        self.similarity = Some(catalog as Arc<dyn SimilarityStore>);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StructuredStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityStore>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 分类专用的（通常更小的）模型
    pub fn with_classifier_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.classifier_llm = Some(llm);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn LiveFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_scope_rules(mut self, rules: ScopeRules) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<Orchestrator, AgentError> {
        let cfg = &self.config;
        let store = self.store.ok_or(AgentError::MissingCollaborator("structured store"))?;
        let similarity = self
            .similarity
            .ok_or(AgentError::MissingCollaborator("similarity store"))?;

        let classifier: Arc<dyn Classifier> = match (self.classifier, self.classifier_llm.or(self.llm.clone())) {
            (Some(c), _) => c,
            (None, Some(llm)) => Arc::new(LlmClassifier::new(llm)),
            (None, None) => return Err(AgentError::MissingCollaborator("classifier")),
        };
        let controller: Arc<dyn Controller> = match (self.controller, self.llm.clone()) {
            (Some(c), _) => c,
            (None, Some(llm)) => Arc::new(LlmController::new(llm)),
            (None, None) => return Err(AgentError::MissingCollaborator("controller")),
        };
        let generator: Arc<dyn TextGenerator> = match (self.generator, self.llm) {
            (Some(g), _) => g,
            (None, Some(llm)) => Arc::new(LlmTextGenerator::new(llm)),
            (None, None) => return Err(AgentError::MissingCollaborator("text generator")),
        };

        let fallback = if cfg.fallback.enabled {
            let fetcher = self.fetcher.ok_or(AgentError::MissingCollaborator("live fetcher"))?;
            let admission = FallbackAdmission::new(
                cfg.fallback.max_concurrent,
                Duration::from_secs(cfg.fallback.queue_timeout_secs),
            );
            Some((fetcher, admission))
        } else {
            tracing::info!("live fallback disabled by config");
            None
        };

        let registry = bootstrap_registry(store, similarity, fallback)?;
        let executor = OperationExecutor::new(
            Arc::new(registry),
            Duration::from_secs(cfg.agent.lookup_timeout_secs),
            Duration::from_secs(cfg.fallback.timeout_secs),
        )
        .with_retry_backoff(Duration::from_millis(cfg.agent.retry_backoff_ms));

        let mut execution = ExecutionLoop::new(Arc::new(executor), controller, cfg.agent.max_iterations)
            .with_history_messages(cfg.agent.history_messages);
        if let Some(tx) = self.event_tx {
            execution = execution.with_event_tx(tx);
        }

        Ok(Orchestrator {
            text_gate: TextScopeGate::new(
                self.rules.unwrap_or_default(),
                classifier.clone(),
                cfg.scope.classifier_history_messages,
            ),
            data_gate: DataScopeGate::new(classifier),
            execution,
            generator,
            sessions: SessionStore::new(cfg.app.max_transcript_messages, cfg.app.session_idle_timeout_secs),
            retain_mentioned_only: cfg.app.retain_mentioned_only,
            history_messages: cfg.agent.history_messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::testing::StubFetcher;
    use crate::llm::MockLlmClient;
    use crate::store::memory::fixtures::sample_snapshot;
    use crate::store::MemoryCatalog;

    fn catalog() -> Arc<MemoryCatalog> {
        Arc::new(MemoryCatalog::new(sample_snapshot()))
    }

    #[test]
    fn test_registry_has_all_categories() {
        let c = catalog();
        let admission = FallbackAdmission::new(1, Duration::from_secs(1));
        let fetcher: Arc<dyn LiveFetcher> = Arc::new(StubFetcher::default());
        let registry = bootstrap_registry(c.clone(), c, Some((fetcher, admission))).unwrap();
        assert_eq!(registry.len(), 14);
        assert!(registry.fallback_operation().is_some());
        let docs = registry.render_documentation();
        assert!(docs.contains("## resolution operations"));
        assert!(docs.contains("fetch_part_live"));
    }

    #[test]
    fn test_registry_without_fallback() {
        let c = catalog();
        let registry = bootstrap_registry(c.clone(), c, None).unwrap();
        assert_eq!(registry.len(), 13);
        assert!(registry.fallback_operation().is_none());
    }

    #[test]
    fn test_missing_collaborators_are_fatal() {
        let err = AgentBuilder::new(AppConfig::default()).build().err().unwrap();
        assert!(matches!(err, AgentError::MissingCollaborator("structured store")));
        assert!(err.is_fatal());

        let err = AgentBuilder::new(AppConfig::default())
            .with_catalog(catalog())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::MissingCollaborator("classifier")));

        // 开启回退却没有抓取端
        let err = AgentBuilder::new(AppConfig::default())
            .with_catalog(catalog())
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::MissingCollaborator("live fetcher")));
    }

    #[test]
    fn test_build_with_fallback_disabled() {
        let mut cfg = AppConfig::default();
        cfg.fallback.enabled = false;
        let orchestrator = AgentBuilder::new(cfg)
            .with_catalog(catalog())
            .with_llm(Arc::new(MockLlmClient::new()))
            .build();
        assert!(orchestrator.is_ok());
    }
}

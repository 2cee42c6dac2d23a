//! Rule Engine + Load Balancer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fields;
use crate::observability::Observer;
use crate::rules::store::RuleStateStore;
use crate::rules::types::{Provider, Rule, Service, Tactic};
use crate::usage::{UsageOutcome, UsageRecorder};

/// Output of a successful rule resolution.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub provider: Provider,
    pub effective_model: String,
    pub rule_uuid: Uuid,
}

pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
    providers: RwLock<Vec<Provider>>,
    store: RuleStateStore,
    usage: Arc<UsageRecorder>,
    observer: Arc<dyn Observer>,
    rule_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RuleEngine {
    pub fn new(
        rules: Vec<Rule>,
        providers: Vec<Provider>,
        store: RuleStateStore,
        usage: Arc<UsageRecorder>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            rules: RwLock::new(rules),
            providers: RwLock::new(providers),
            store,
            usage,
            observer,
            rule_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, rule_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(l) = self.rule_locks.read().await.get(&rule_id) {
            return l.clone();
        }
        let mut locks = self.rule_locks.write().await;
        locks
            .entry(rule_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Snapshot of the currently configured rules, for listing endpoints.
    pub async fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    async fn resolve_provider(&self, id: Uuid) -> Option<Provider> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    async fn provider_resolves(&self, id: Uuid) -> bool {
        self.providers.read().await.iter().any(|p| p.id == id && p.is_valid())
    }

    /// Looks up a configured provider's id by name, used to correlate an
    /// OAuth callback back to the provider it authorizes.
    pub async fn provider_id_by_name(&self, name: &str) -> Option<Uuid> {
        self.providers.read().await.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Resolve `(scenario, requested_model)` to a concrete service.
    pub async fn resolve(&self, scenario: &str, requested_model: &str) -> Result<ResolvedService> {
        let rules = self.rules.read().await.clone();

        for rule in rules.iter() {
            if rule.scenario != scenario || !rule.model_matches(requested_model) {
                continue;
            }
            let mut resolves_any = false;
            for s in &rule.services {
                if s.active && self.provider_resolves(s.provider).await {
                    resolves_any = true;
                    break;
                }
            }
            if !rule.active || !resolves_any {
                continue;
            }

            let lock = self.lock_for(rule.id).await;
            let _guard = lock.lock().await;

            let mut eligible: Vec<Service> = Vec::new();
            for s in &rule.services {
                if s.active && s.weight > 0 && self.provider_resolves(s.provider).await {
                    eligible.push(s.clone());
                }
            }
            if eligible.is_empty() {
                return Err(Error::Exhausted(format!(
                    "rule {} has no eligible services",
                    rule.id
                )));
            }

            let chosen = self.select_service(&rule, &eligible).await?;
            let provider = self
                .resolve_provider(chosen.provider)
                .await
                .ok_or_else(|| Error::NotFound(format!("provider {} not found", chosen.provider)))?;

            self.bump_window(rule.id, &chosen).await;

            return Ok(ResolvedService {
                provider,
                effective_model: chosen.model.clone(),
                rule_uuid: rule.id,
            });
        }

        Err(Error::NotFound(format!(
            "no configured rule for scenario '{scenario}' model '{requested_model}'"
        )))
    }

    async fn select_service(&self, rule: &Rule, eligible: &[Service]) -> Result<Service> {
        match rule.tactic {
            Tactic::Failover => Ok(eligible[0].clone()),
            Tactic::Priority => {
                let max_weight = eligible.iter().map(|s| s.weight).max().unwrap_or(0);
                Ok(eligible
                    .iter()
                    .find(|s| s.weight == max_weight)
                    .cloned()
                    .unwrap())
            }
            Tactic::Weighted => {
                let total: u32 = eligible.iter().map(|s| s.weight).sum();
                let mut pick = rand::thread_rng().gen_range(0..total.max(1));
                for s in eligible {
                    if pick < s.weight {
                        return Ok(s.clone());
                    }
                    pick -= s.weight;
                }
                Ok(eligible.last().unwrap().clone())
            }
            Tactic::RoundRobin => self.round_robin_select(rule, eligible).await,
        }
    }

    async fn round_robin_select(&self, rule: &Rule, eligible: &[Service]) -> Result<Service> {
        let stored = self.store.get_pointer(rule.id).await.unwrap_or(None);

        let current_idx = stored.as_deref().and_then(|value| {
            eligible.iter().position(|s| s.key() == value)
        });

        let next_idx = match current_idx {
            Some(idx) => (idx + 1) % eligible.len(),
            None => {
                if stored.is_some() {
                    // Pointer hydration miss — rename/delete invalidated it.
                    self.observer.record_event(
                        "rules",
                        "rule.pointer_hydration_miss",
                        &fields!(rule_id = rule.id, stored = stored.clone().unwrap_or_default()),
                    );
                }
                0
            }
        };

        let chosen = eligible[next_idx].clone();
        self.store.set_pointer(rule.id, &chosen.key()).await.ok();
        Ok(chosen)
    }

    async fn bump_window(&self, rule_id: Uuid, service: &Service) {
        let mut rules = self.rules.write().await;
        let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) else {
            return;
        };
        let Some(svc) = rule
            .services
            .iter_mut()
            .find(|s| s.provider == service.provider && s.model == service.model)
        else {
            return;
        };
        let now = Utc::now().timestamp();
        if svc.time_window_seconds > 0
            && now >= svc.stats.window_start + svc.time_window_seconds
        {
            svc.stats.window_start = now;
            svc.stats.window_request_count = 0;
            svc.stats.window_tokens_consumed = 0;
            svc.stats.window_input_tokens = 0;
            svc.stats.window_output_tokens = 0;
        }
        if svc.stats.window_start == 0 {
            svc.stats.window_start = now;
        }
    }

    /// Record the outcome of a dispatched call, feeding both the service
    /// window and the Usage Recorder.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_outcome(
        &self,
        resolved: &ResolvedService,
        scenario: &str,
        request_model: &str,
        input_tokens: u64,
        output_tokens: u64,
        outcome: UsageOutcome,
        latency_ms: u64,
        streamed: bool,
    ) -> Result<()> {
        {
            let lock = self.lock_for(resolved.rule_uuid).await;
            let _guard = lock.lock().await;
            let mut rules = self.rules.write().await;
            if let Some(rule) = rules.iter_mut().find(|r| r.id == resolved.rule_uuid) {
                if let Some(svc) = rule.services.iter_mut().find(|s| {
                    s.provider == resolved.provider.id && s.model == resolved.effective_model
                }) {
                    svc.stats.window_request_count += 1;
                    svc.stats.window_tokens_consumed += input_tokens + output_tokens;
                    svc.stats.window_input_tokens += input_tokens;
                    svc.stats.window_output_tokens += output_tokens;
                }
            }
        }

        self.usage
            .record(crate::usage::NewUsageRecord {
                provider: resolved.provider.id,
                provider_name: resolved.provider.name.clone(),
                model: resolved.effective_model.clone(),
                scenario: scenario.to_string(),
                rule: resolved.rule_uuid,
                request_model: request_model.to_string(),
                input_tokens,
                output_tokens,
                status: outcome,
                error_code: None,
                latency_ms,
                streamed,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::{ApiStyle, AuthType, ServiceStats};

    fn provider(name: &str) -> Provider {
        Provider {
            id: Uuid::new_v4(),
            name: name.to_string(),
            api_style: ApiStyle::Openai,
            api_base: "https://api.example.com".into(),
            auth_type: AuthType::Key,
            access_token: Some("sk-test".into()),
            oauth_detail: None,
            proxy_url: None,
        }
    }

    async fn make_engine(tactic: Tactic, providers: Vec<Provider>) -> (RuleEngine, Uuid) {
        let rule_id = Uuid::new_v4();
        let services = providers
            .iter()
            .map(|p| Service {
                provider: p.id,
                model: "m".into(),
                weight: 1,
                active: true,
                time_window_seconds: 0,
                stats: ServiceStats::default(),
            })
            .collect();
        let rule = Rule {
            id: rule_id,
            scenario: "openai".into(),
            model_pattern: None,
            response_model_override: None,
            active: true,
            services,
            tactic,
        };
        let store = RuleStateStore::open_in_memory().unwrap();
        let usage = Arc::new(UsageRecorder::open_in_memory().unwrap());
        let observer: Arc<dyn Observer> = Arc::new(crate::observability::LogObserver::new());
        (
            RuleEngine::new(vec![rule], providers, store, usage, observer),
            rule_id,
        )
    }

    #[tokio::test]
    async fn round_robin_alternates_s1() {
        let (engine, _rule_id) = make_engine(
            Tactic::RoundRobin,
            vec![provider("providerA"), provider("providerB")],
        )
        .await;

        let mut names = Vec::new();
        for _ in 0..4 {
            let resolved = engine.resolve("openai", "gpt-4").await.unwrap();
            names.push(resolved.provider.name.clone());
        }
        assert_eq!(names, vec!["providerA", "providerB", "providerA", "providerB"]);
    }

    #[tokio::test]
    async fn single_service_selects_deterministically_under_all_tactics() {
        for tactic in [Tactic::RoundRobin, Tactic::Weighted, Tactic::Failover, Tactic::Priority] {
            let (engine, _) = make_engine(tactic, vec![provider("only")]).await;
            let resolved = engine.resolve("openai", "gpt-4").await.unwrap();
            assert_eq!(resolved.provider.name, "only");
        }
    }

    #[tokio::test]
    async fn zero_eligible_services_is_exhausted_s6() {
        let rule_id = Uuid::new_v4();
        let rule = Rule {
            id: rule_id,
            scenario: "openai".into(),
            model_pattern: None,
            response_model_override: None,
            active: true,
            services: vec![Service {
                provider: Uuid::new_v4(), // does not resolve
                model: "gpt-4".into(),
                weight: 1,
                active: true,
                time_window_seconds: 0,
                stats: ServiceStats::default(),
            }],
            tactic: Tactic::Failover,
        };
        let store = RuleStateStore::open_in_memory().unwrap();
        let usage = Arc::new(UsageRecorder::open_in_memory().unwrap());
        let observer: Arc<dyn Observer> = Arc::new(crate::observability::LogObserver::new());
        let engine = RuleEngine::new(vec![rule], vec![], store, usage, observer);

        let err = engine.resolve("openai", "gpt-4").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn priority_tactic_breaks_ties_by_insertion_order() {
        let p1 = provider("first");
        let p2 = provider("second");
        let rule_id = Uuid::new_v4();
        let services = vec![
            Service {
                provider: p1.id,
                model: "m".into(),
                weight: 5,
                active: true,
                time_window_seconds: 0,
                stats: ServiceStats::default(),
            },
            Service {
                provider: p2.id,
                model: "m".into(),
                weight: 5,
                active: true,
                time_window_seconds: 0,
                stats: ServiceStats::default(),
            },
        ];
        let rule = Rule {
            id: rule_id,
            scenario: "openai".into(),
            model_pattern: None,
            response_model_override: None,
            active: true,
            services,
            tactic: Tactic::Priority,
        };
        let store = RuleStateStore::open_in_memory().unwrap();
        let usage = Arc::new(UsageRecorder::open_in_memory().unwrap());
        let observer: Arc<dyn Observer> = Arc::new(crate::observability::LogObserver::new());
        let engine = RuleEngine::new(vec![rule], vec![p1.clone(), p2], store, usage, observer);

        let resolved = engine.resolve("openai", "gpt-4").await.unwrap();
        assert_eq!(resolved.provider.id, p1.id);
    }
}

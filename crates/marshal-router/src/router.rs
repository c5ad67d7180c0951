use parking_lot::RwLock;

use marshal_core::config::RouteRuleConfig;
use marshal_core::event::WorkerEvent;
use marshal_core::ids::RuleId;

use crate::delivery::RouteMatch;
use crate::predicate::{Predicate, PredicateError};

#[derive(Clone, Debug)]
pub struct RouteRule {
    pub id: RuleId,
    pub name: String,
    pub predicate: Predicate,
    pub sink: String,
}

/// The rule table. Evaluation is pure: it returns every matching
/// (event, sink) pair and leaves delivery to someone else. All matching
/// rules fire; order carries no priority.
#[derive(Default)]
pub struct Router {
    rules: RwLock<Vec<RouteRule>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[RouteRuleConfig]) -> Result<Self, PredicateError> {
        let router = Self::new();
        for route in routes {
            router.add_rule(&route.name, &route.predicate, &route.sink)?;
        }
        Ok(router)
    }

    pub fn add_rule(
        &self,
        name: &str,
        predicate: &str,
        sink: &str,
    ) -> Result<RuleId, PredicateError> {
        let rule = RouteRule {
            id: RuleId::new(),
            name: name.to_string(),
            predicate: Predicate::parse(predicate)?,
            sink: sink.to_string(),
        };
        tracing::debug!(rule_id = %rule.id, name, sink, "route rule added");
        let id = rule.id.clone();
        self.rules.write().push(rule);
        Ok(id)
    }

    pub fn remove_rule(&self, id: &RuleId) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| &r.id != id);
        rules.len() != before
    }

    pub fn rules(&self) -> Vec<RouteRule> {
        self.rules.read().clone()
    }

    pub fn evaluate(&self, event: &WorkerEvent) -> Vec<RouteMatch> {
        self.rules
            .read()
            .iter()
            .filter(|rule| rule.predicate.matches(event))
            .map(|rule| RouteMatch {
                rule: rule.name.clone(),
                sink: rule.sink.clone(),
                event: event.clone(),
            })
            .collect()
    }
}

//! Cognigate Policy - prioritized rule evaluation over intents.
//!
//! Policies are configuration data, not code: each rule carries a typed
//! condition tree evaluated by a small interpreter. Rules are grouped by
//! category and walked strictly in category priority order; within a
//! category the walk is rule-id order. The first matching deny/escalate
//! is terminal. `limit` matches are recorded and evaluation continues in
//! case a later category denies or escalates; otherwise the most
//! restrictive recorded limit becomes the verdict.
//!
//! Two matching rules of the same category with incompatible actions are
//! a configuration error. The engine surfaces the conflict (logged and
//! attached to the verdict) and resolves it by rule-id order rather than
//! guessing.

#![deny(unsafe_code)]

use cognigate_types::{PolicyAction, PolicyCategory, PolicyReference, RiskLevel, TrustTier};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Field a comparison reads. `Context` keys index the intent's context
/// map; a missing key never matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRef {
    TrustScore,
    TrustTier,
    RiskLevel,
    Action,
    Context(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

/// Boolean condition tree. Combinators must be non-empty; `In` requires
/// an array operand. Both are checked when the policy is added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        field: FieldRef,
        op: CompareOp,
        value: Value,
    },
}

/// Capability reduction attached to a `limit` rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyLimit {
    /// Requested capabilities to strip from the grant.
    pub drop_capabilities: Vec<String>,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub category: PolicyCategory,
    pub description: String,
    pub condition: Condition,
    pub action: PolicyAction,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Required when `action` is `limit`, rejected otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<PolicyLimit>,
    /// Review queue for `escalate` rules. Falls back to the service
    /// default target when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Same-category rules that matched with incompatible actions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConflict {
    pub category: PolicyCategory,
    pub rule_ids: Vec<String>,
    /// Rule that won the tie-break (lowest rule id).
    pub resolved_by: String,
}

/// Outcome of one evaluation pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub action: PolicyAction,
    /// Every rule that matched, in evaluation order.
    pub matched: Vec<PolicyReference>,
    /// Rule that decided the verdict. `None` for the default allow.
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<PolicyLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PolicyConflict>,
}

impl PolicyVerdict {
    fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            matched: vec![],
            decided_by: None,
            limit: None,
            escalation_target: None,
            conflicts: vec![],
        }
    }
}

/// Evaluation input assembled by the decision engine.
#[derive(Clone, Debug)]
pub struct PolicyInput<'a> {
    pub trust_score: u32,
    pub trust_tier: TrustTier,
    pub risk_level: RiskLevel,
    pub action: &'a str,
    pub context: &'a HashMap<String, Value>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy `{0}` already registered")]
    Duplicate(String),

    #[error("policy `{0}` not found")]
    NotFound(String),

    #[error("invalid policy `{id}`: {detail}")]
    Invalid { id: String, detail: String },
}

impl PolicyError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PolicyError::Duplicate(_) => "E1307",
            PolicyError::NotFound(_) => "E1308",
            PolicyError::Invalid { .. } => "E1309",
        }
    }
}

/// Rule store plus interpreter. Writers (policy administration) are
/// rare; evaluation takes the read side only.
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(vec![]),
        }
    }

    pub fn from_policies(policies: Vec<Policy>) -> Result<Self, PolicyError> {
        let engine = Self::new();
        for policy in policies {
            engine.add_policy(policy)?;
        }
        Ok(engine)
    }

    /// Validate and insert a rule, keeping the store sorted by
    /// (category, id) so evaluation order never depends on insertion
    /// order.
    pub fn add_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        validate_policy(&policy)?;
        let mut policies = self.policies.write();
        if policies.iter().any(|p| p.id == policy.id) {
            return Err(PolicyError::Duplicate(policy.id));
        }
        policies.push(policy);
        policies.sort_by(|a, b| (a.category, &a.id).cmp(&(b.category, &b.id)));
        Ok(())
    }

    pub fn remove_policy(&self, id: &str) -> Result<(), PolicyError> {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.id != id);
        if policies.len() == before {
            return Err(PolicyError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), PolicyError> {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.id == id) {
            Some(policy) => {
                policy.active = active;
                Ok(())
            }
            None => Err(PolicyError::NotFound(id.to_string())),
        }
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    pub fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyVerdict {
        let policies = self.policies.read();
        let mut verdict = PolicyVerdict::allow();
        let mut best_limit: Option<(String, PolicyLimit)> = None;

        for category in PolicyCategory::ALL {
            // The store is sorted, so hits come out in rule-id order.
            let hits: Vec<&Policy> = policies
                .iter()
                .filter(|p| p.active && p.category == category)
                .filter(|p| eval_condition(&p.condition, input))
                .collect();
            if hits.is_empty() {
                continue;
            }

            for hit in &hits {
                verdict.matched.push(PolicyReference {
                    policy_id: hit.id.clone(),
                    category: hit.category,
                    action: hit.action,
                });
            }

            if let Some(conflict) = detect_conflict(category, &hits) {
                tracing::warn!(
                    category = ?conflict.category,
                    rule_ids = ?conflict.rule_ids,
                    resolved_by = %conflict.resolved_by,
                    "conflicting policy rules matched in one category"
                );
                verdict.conflicts.push(conflict);
            }

            if let Some(decider) = hits
                .iter()
                .find(|p| matches!(p.action, PolicyAction::Deny | PolicyAction::Escalate))
            {
                verdict.action = decider.action;
                verdict.decided_by = Some(decider.id.clone());
                verdict.escalation_target = decider.escalation_target.clone();
                return verdict;
            }

            for hit in &hits {
                if hit.action != PolicyAction::Limit {
                    continue;
                }
                if let Some(limit) = &hit.limit {
                    // Equal drop counts fall back to the lowest rule id,
                    // across categories too.
                    let more_restrictive = match &best_limit {
                        Some((current_id, current)) => {
                            limit.drop_capabilities.len() > current.drop_capabilities.len()
                                || (limit.drop_capabilities.len()
                                    == current.drop_capabilities.len()
                                    && hit.id < *current_id)
                        }
                        None => true,
                    };
                    if more_restrictive {
                        best_limit = Some((hit.id.clone(), limit.clone()));
                    }
                }
            }
        }

        if let Some((id, limit)) = best_limit {
            verdict.action = PolicyAction::Limit;
            verdict.decided_by = Some(id);
            verdict.limit = Some(limit);
        }
        verdict
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Deny, escalate and allow are mutually incompatible outcomes for one
/// category. Limit composes with allow and is not treated as a
/// conflict on its own.
fn detect_conflict(category: PolicyCategory, hits: &[&Policy]) -> Option<PolicyConflict> {
    let has = |action: PolicyAction| hits.iter().any(|p| p.action == action);
    let incompatible = (has(PolicyAction::Deny) && has(PolicyAction::Allow))
        || (has(PolicyAction::Escalate) && has(PolicyAction::Allow))
        || (has(PolicyAction::Deny) && has(PolicyAction::Escalate));
    if !incompatible {
        return None;
    }
    let rule_ids: Vec<String> = hits
        .iter()
        .filter(|p| p.action != PolicyAction::Limit)
        .map(|p| p.id.clone())
        .collect();
    let resolved_by = hits
        .iter()
        .find(|p| matches!(p.action, PolicyAction::Deny | PolicyAction::Escalate))
        .map(|p| p.id.clone())?;
    Some(PolicyConflict {
        category,
        rule_ids,
        resolved_by,
    })
}

fn validate_policy(policy: &Policy) -> Result<(), PolicyError> {
    let invalid = |detail: String| PolicyError::Invalid {
        id: policy.id.clone(),
        detail,
    };
    if policy.id.is_empty() {
        return Err(invalid("empty policy id".to_string()));
    }
    if policy.action == PolicyAction::Limit && policy.limit.is_none() {
        return Err(invalid("limit action without a limit payload".to_string()));
    }
    if policy.action != PolicyAction::Limit && policy.limit.is_some() {
        return Err(invalid(format!(
            "limit payload on a {:?} rule",
            policy.action
        )));
    }
    validate_condition(&policy.condition).map_err(invalid)
}

fn validate_condition(condition: &Condition) -> Result<(), String> {
    match condition {
        Condition::All(inner) | Condition::Any(inner) => {
            if inner.is_empty() {
                return Err("empty combinator".to_string());
            }
            inner.iter().try_for_each(validate_condition)
        }
        Condition::Not(inner) => validate_condition(inner),
        Condition::Compare { field, op, value } => validate_compare(field, *op, value),
    }
}

fn validate_compare(field: &FieldRef, op: CompareOp, value: &Value) -> Result<(), String> {
    let operands: Vec<&Value> = if op == CompareOp::In {
        match value.as_array() {
            Some(items) if !items.is_empty() => items.iter().collect(),
            Some(_) => return Err("empty `in` operand".to_string()),
            None => return Err("`in` requires an array operand".to_string()),
        }
    } else {
        vec![value]
    };
    for operand in operands {
        match field {
            FieldRef::TrustScore => {
                if operand.as_f64().is_none() {
                    return Err(format!("trust_score compared against {operand}"));
                }
            }
            FieldRef::TrustTier => {
                serde_json::from_value::<TrustTier>(operand.clone())
                    .map_err(|_| format!("unknown trust tier {operand}"))?;
            }
            FieldRef::RiskLevel => {
                serde_json::from_value::<RiskLevel>(operand.clone())
                    .map_err(|_| format!("unknown risk level {operand}"))?;
            }
            FieldRef::Action => {
                if operand.as_str().is_none() {
                    return Err(format!("action compared against {operand}"));
                }
            }
            FieldRef::Context(_) => {}
        }
    }
    Ok(())
}

fn eval_condition(condition: &Condition, input: &PolicyInput<'_>) -> bool {
    match condition {
        Condition::All(inner) => inner.iter().all(|c| eval_condition(c, input)),
        Condition::Any(inner) => inner.iter().any(|c| eval_condition(c, input)),
        Condition::Not(inner) => !eval_condition(inner, input),
        Condition::Compare { field, op, value } => eval_compare(field, *op, value, input),
    }
}

fn eval_compare(field: &FieldRef, op: CompareOp, value: &Value, input: &PolicyInput<'_>) -> bool {
    match field {
        FieldRef::TrustScore => compare_number(f64::from(input.trust_score), op, value),
        FieldRef::TrustTier => compare_parsed(input.trust_tier, op, value),
        FieldRef::RiskLevel => compare_parsed(input.risk_level, op, value),
        FieldRef::Action => compare_str(input.action, op, value),
        FieldRef::Context(key) => match input.context.get(key) {
            Some(actual) => compare_values(actual, op, value),
            None => false,
        },
    }
}

fn apply_ord<T: PartialOrd>(lhs: T, op: CompareOp, rhs: T) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::Ge => lhs >= rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::In => false,
    }
}

fn compare_number(lhs: f64, op: CompareOp, value: &Value) -> bool {
    if op == CompareOp::In {
        return value
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_f64).any(|x| x == lhs))
            .unwrap_or(false);
    }
    value.as_f64().map(|rhs| apply_ord(lhs, op, rhs)).unwrap_or(false)
}

fn compare_str(lhs: &str, op: CompareOp, value: &Value) -> bool {
    if op == CompareOp::In {
        return value
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_str).any(|x| x == lhs))
            .unwrap_or(false);
    }
    value.as_str().map(|rhs| apply_ord(lhs, op, rhs)).unwrap_or(false)
}

fn compare_parsed<T>(lhs: T, op: CompareOp, value: &Value) -> bool
where
    T: serde::de::DeserializeOwned + PartialOrd + Copy,
{
    let parse = |v: &Value| serde_json::from_value::<T>(v.clone()).ok();
    if op == CompareOp::In {
        return value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(parse)
                    .any(|rhs| apply_ord(lhs, CompareOp::Eq, rhs))
            })
            .unwrap_or(false);
    }
    parse(value).map(|rhs| apply_ord(lhs, op, rhs)).unwrap_or(false)
}

/// Context values compare only within their own JSON type; numbers go
/// through f64 so `5` and `5.0` agree.
fn compare_values(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    if op == CompareOp::In {
        return rhs
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(lhs, item)))
            .unwrap_or(false);
    }
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(l), Some(r)) => return apply_ord(l, op, r),
        _ => {}
    }
    if let (Some(l), Some(r)) = (lhs.as_str(), rhs.as_str()) {
        return apply_ord(l, op, r);
    }
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        _ => false,
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => lhs == rhs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compare(field: FieldRef, op: CompareOp, value: Value) -> Condition {
        Condition::Compare { field, op, value }
    }

    fn rule(id: &str, category: PolicyCategory, action: PolicyAction, condition: Condition) -> Policy {
        Policy {
            id: id.to_string(),
            category,
            description: format!("test rule {id}"),
            condition,
            action,
            active: true,
            limit: None,
            escalation_target: None,
        }
    }

    fn input<'a>(
        score: u32,
        risk: RiskLevel,
        action: &'a str,
        context: &'a HashMap<String, Value>,
    ) -> PolicyInput<'a> {
        PolicyInput {
            trust_score: score,
            trust_tier: TrustTier::from_score(score),
            risk_level: risk,
            action,
            context,
        }
    }

    #[test]
    fn hard_disqualifier_deny_beats_soft_constraint_allow() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "block-critical",
                PolicyCategory::HardDisqualifier,
                PolicyAction::Deny,
                compare(FieldRef::RiskLevel, CompareOp::Eq, json!("critical")),
            ))
            .unwrap();
        engine
            .add_policy(rule(
                "allow-known-action",
                PolicyCategory::SoftConstraint,
                PolicyAction::Allow,
                compare(FieldRef::Action, CompareOp::Eq, json!("transfer_funds")),
            ))
            .unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(800, RiskLevel::Critical, "transfer_funds", &ctx));
        assert_eq!(verdict.action, PolicyAction::Deny);
        assert_eq!(verdict.decided_by.as_deref(), Some("block-critical"));
        assert_eq!(verdict.matched.len(), 1);
        assert!(verdict.conflicts.is_empty());
    }

    #[test]
    fn limit_is_recorded_but_later_deny_wins() {
        let engine = PolicyEngine::new();
        let mut limiter = rule(
            "trim-shell",
            PolicyCategory::SecurityCritical,
            PolicyAction::Limit,
            compare(FieldRef::TrustScore, CompareOp::Lt, json!(600)),
        );
        limiter.limit = Some(PolicyLimit {
            drop_capabilities: vec!["tools:shell/run".to_string()],
            reason: "shell restricted below standard trust".to_string(),
        });
        engine.add_policy(limiter).unwrap();
        engine
            .add_policy(rule(
                "deny-untrusted-transfer",
                PolicyCategory::PolicyEnforcement,
                PolicyAction::Deny,
                compare(FieldRef::Action, CompareOp::Eq, json!("transfer_funds")),
            ))
            .unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(400, RiskLevel::Medium, "transfer_funds", &ctx));
        assert_eq!(verdict.action, PolicyAction::Deny);
        assert_eq!(verdict.decided_by.as_deref(), Some("deny-untrusted-transfer"));
        // The limit match is still on the record for the audit trail.
        assert!(verdict.matched.iter().any(|r| r.policy_id == "trim-shell"));
        assert!(verdict.limit.is_none());
    }

    #[test]
    fn most_restrictive_limit_wins_when_nothing_denies() {
        let engine = PolicyEngine::new();
        let mut small = rule(
            "a-trim-one",
            PolicyCategory::PolicyEnforcement,
            PolicyAction::Limit,
            compare(FieldRef::RiskLevel, CompareOp::Ge, json!("medium")),
        );
        small.limit = Some(PolicyLimit {
            drop_capabilities: vec!["tools:shell/run".to_string()],
            reason: "one capability".to_string(),
        });
        let mut wide = rule(
            "b-trim-two",
            PolicyCategory::SoftConstraint,
            PolicyAction::Limit,
            compare(FieldRef::RiskLevel, CompareOp::Ge, json!("medium")),
        );
        wide.limit = Some(PolicyLimit {
            drop_capabilities: vec![
                "tools:shell/run".to_string(),
                "comms:email/send".to_string(),
            ],
            reason: "two capabilities".to_string(),
        });
        engine.add_policy(small).unwrap();
        engine.add_policy(wide).unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(500, RiskLevel::High, "run_job", &ctx));
        assert_eq!(verdict.action, PolicyAction::Limit);
        assert_eq!(verdict.decided_by.as_deref(), Some("b-trim-two"));
        assert_eq!(
            verdict.limit.unwrap().drop_capabilities.len(),
            2
        );
    }

    #[test]
    fn equally_restrictive_limits_tie_break_to_the_lowest_id() {
        let engine = PolicyEngine::new();
        let mut earlier_category = rule(
            "z-trim-shell",
            PolicyCategory::PolicyEnforcement,
            PolicyAction::Limit,
            compare(FieldRef::RiskLevel, CompareOp::Ge, json!("medium")),
        );
        earlier_category.limit = Some(PolicyLimit {
            drop_capabilities: vec!["tools:shell/run".to_string()],
            reason: "shell trimmed".to_string(),
        });
        let mut lower_id = rule(
            "a-trim-email",
            PolicyCategory::SoftConstraint,
            PolicyAction::Limit,
            compare(FieldRef::RiskLevel, CompareOp::Ge, json!("medium")),
        );
        lower_id.limit = Some(PolicyLimit {
            drop_capabilities: vec!["comms:email/send".to_string()],
            reason: "email trimmed".to_string(),
        });
        engine.add_policy(earlier_category).unwrap();
        engine.add_policy(lower_id).unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(500, RiskLevel::High, "run_job", &ctx));
        assert_eq!(verdict.action, PolicyAction::Limit);
        // Category order does not break the tie; the rule id does.
        assert_eq!(verdict.decided_by.as_deref(), Some("a-trim-email"));
        assert_eq!(verdict.limit.unwrap().reason, "email trimmed");
    }

    #[test]
    fn same_category_conflict_is_surfaced_and_lowest_id_wins() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "a-deny",
                PolicyCategory::PolicyEnforcement,
                PolicyAction::Deny,
                compare(FieldRef::Action, CompareOp::Eq, json!("export_data")),
            ))
            .unwrap();
        engine
            .add_policy(rule(
                "b-allow",
                PolicyCategory::PolicyEnforcement,
                PolicyAction::Allow,
                compare(FieldRef::Action, CompareOp::Eq, json!("export_data")),
            ))
            .unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(700, RiskLevel::Low, "export_data", &ctx));
        assert_eq!(verdict.action, PolicyAction::Deny);
        assert_eq!(verdict.conflicts.len(), 1);
        let conflict = &verdict.conflicts[0];
        assert_eq!(conflict.resolved_by, "a-deny");
        assert!(conflict.rule_ids.contains(&"b-allow".to_string()));
    }

    #[test]
    fn escalate_carries_its_target() {
        let engine = PolicyEngine::new();
        let mut escalator = rule(
            "review-pii",
            PolicyCategory::RegulatoryMandate,
            PolicyAction::Escalate,
            compare(
                FieldRef::Context("data_class".to_string()),
                CompareOp::Eq,
                json!("pii"),
            ),
        );
        escalator.escalation_target = Some("privacy-review".to_string());
        engine.add_policy(escalator).unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("data_class".to_string(), json!("pii"));
        let verdict = engine.evaluate(&input(900, RiskLevel::Medium, "export_data", &ctx));
        assert_eq!(verdict.action, PolicyAction::Escalate);
        assert_eq!(verdict.escalation_target.as_deref(), Some("privacy-review"));
    }

    #[test]
    fn missing_context_key_never_matches() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "deny-external",
                PolicyCategory::SecurityCritical,
                PolicyAction::Deny,
                compare(
                    FieldRef::Context("destination".to_string()),
                    CompareOp::Eq,
                    json!("external"),
                ),
            ))
            .unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(500, RiskLevel::Low, "send_file", &ctx));
        assert_eq!(verdict.action, PolicyAction::Allow);
        assert!(verdict.matched.is_empty());
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "deny-everything",
                PolicyCategory::HardDisqualifier,
                PolicyAction::Deny,
                compare(FieldRef::TrustScore, CompareOp::Ge, json!(0)),
            ))
            .unwrap();
        engine.set_active("deny-everything", false).unwrap();

        let ctx = HashMap::new();
        let verdict = engine.evaluate(&input(500, RiskLevel::Low, "noop", &ctx));
        assert_eq!(verdict.action, PolicyAction::Allow);
    }

    #[test]
    fn tier_comparisons_use_tier_ordering() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "deny-below-limited",
                PolicyCategory::PolicyEnforcement,
                PolicyAction::Deny,
                compare(FieldRef::TrustTier, CompareOp::Lt, json!("limited")),
            ))
            .unwrap();

        let ctx = HashMap::new();
        let low = engine.evaluate(&input(150, RiskLevel::Low, "noop", &ctx));
        assert_eq!(low.action, PolicyAction::Deny);
        let ok = engine.evaluate(&input(350, RiskLevel::Low, "noop", &ctx));
        assert_eq!(ok.action, PolicyAction::Allow);
    }

    #[test]
    fn combinators_nest() {
        let engine = PolicyEngine::new();
        engine
            .add_policy(rule(
                "deny-risky-offhours",
                PolicyCategory::SecurityCritical,
                PolicyAction::Deny,
                Condition::All(vec![
                    compare(FieldRef::RiskLevel, CompareOp::Ge, json!("high")),
                    Condition::Not(Box::new(compare(
                        FieldRef::Context("window".to_string()),
                        CompareOp::Eq,
                        json!("business_hours"),
                    ))),
                ]),
            ))
            .unwrap();

        let mut ctx = HashMap::new();
        ctx.insert("window".to_string(), json!("business_hours"));
        let in_hours = engine.evaluate(&input(800, RiskLevel::High, "deploy", &ctx));
        assert_eq!(in_hours.action, PolicyAction::Allow);

        ctx.insert("window".to_string(), json!("overnight"));
        let off_hours = engine.evaluate(&input(800, RiskLevel::High, "deploy", &ctx));
        assert_eq!(off_hours.action, PolicyAction::Deny);
    }

    #[test]
    fn validation_rejects_malformed_rules() {
        let engine = PolicyEngine::new();

        let no_limit_payload = rule(
            "limit-without-payload",
            PolicyCategory::SoftConstraint,
            PolicyAction::Limit,
            compare(FieldRef::TrustScore, CompareOp::Lt, json!(100)),
        );
        assert!(matches!(
            engine.add_policy(no_limit_payload),
            Err(PolicyError::Invalid { .. })
        ));

        let scalar_in = rule(
            "in-needs-array",
            PolicyCategory::SoftConstraint,
            PolicyAction::Deny,
            compare(FieldRef::Action, CompareOp::In, json!("not-an-array")),
        );
        assert!(matches!(
            engine.add_policy(scalar_in),
            Err(PolicyError::Invalid { .. })
        ));

        let bad_tier = rule(
            "unknown-tier",
            PolicyCategory::SoftConstraint,
            PolicyAction::Deny,
            compare(FieldRef::TrustTier, CompareOp::Eq, json!("platinum")),
        );
        assert!(matches!(
            engine.add_policy(bad_tier),
            Err(PolicyError::Invalid { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let engine = PolicyEngine::new();
        let first = rule(
            "dup",
            PolicyCategory::SoftConstraint,
            PolicyAction::Allow,
            compare(FieldRef::TrustScore, CompareOp::Ge, json!(0)),
        );
        engine.add_policy(first.clone()).unwrap();
        assert!(matches!(
            engine.add_policy(first),
            Err(PolicyError::Duplicate(_))
        ));
    }
}

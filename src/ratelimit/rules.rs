//! Quota rules and rule-chain matching.
//!
//! Rules are installed in precedence order and compiled once. Matching an
//! operation walks the rules in order and collects every match up to and
//! including the first `stop` rule, so `canary` rules are evaluated alongside
//! the rule that actually decides the outcome.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Free-form attributes describing the thing being rate limited.
pub type Operation = BTreeMap<String, String>;

/// Longest label we accept.
const MAX_LABEL_LEN: usize = 255;

/// Longest credit interval a rule may declare, in seconds.
pub const MAX_RESET_SECONDS: i64 = i32::MAX as i64;

/// Errors raised while building a [`ConfigStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Invalid creditLimit for operation={operation} ({value})")]
    InvalidCreditLimit { operation: String, value: String },

    #[error("Invalid resetSeconds for operation={operation} ({value})")]
    InvalidResetSeconds { operation: String, value: String },

    #[error("Invalid label \"{0}\": must match [a-zA-Z0-9_-]{{1,255}}")]
    InvalidLabel(String),

    #[error("Label \"{0}\" is already in use")]
    DuplicateLabel(String),

    #[error("Unreachable rule for operation={operation}; masked by operation={masked_by}")]
    UnreachableRule { operation: String, masked_by: String },

    #[error("Invalid glob value \"{value}\": {reason}")]
    InvalidGlob { value: String, reason: String },

    #[error("Config must contain at least one rule")]
    Empty,

    #[error("Last rule must be the default rule (empty operation), found operation={0}")]
    MissingDefault(String),
}

/// What happens after a rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Bill the rule and let it decide the response.
    #[default]
    Stop,
    /// Bill and instrument the rule, then keep looking for a `stop` rule.
    Canary,
}

/// A loosely-typed numeric field, as it appears in rule documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Quantity {
    /// The integer value, if this quantity holds one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Quantity::Integer(n) => Some(*n),
            Quantity::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Quantity::Float(_) => None,
            Quantity::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<i64> for Quantity {
    fn from(n: i64) -> Self {
        Quantity::Integer(n)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Integer(n) => write!(f, "{}", n),
            Quantity::Float(n) => write!(f, "{}", n),
            Quantity::Text(s) => write!(f, "{}", s),
        }
    }
}

/// An uncompiled rule definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSpec {
    pub operation: Operation,
    pub credit_limit: Option<Quantity>,
    pub reset_seconds: Option<Quantity>,
    pub actor_field: Option<String>,
    pub match_policy: MatchPolicy,
    pub label: Option<String>,
    pub comment: Option<String>,
}

impl RuleSpec {
    pub fn new(operation: Operation, credit_limit: i64, reset_seconds: i64) -> Self {
        Self {
            operation,
            credit_limit: Some(credit_limit.into()),
            reset_seconds: Some(reset_seconds.into()),
            ..Self::default()
        }
    }

    pub fn actor_field(mut self, field: impl Into<String>) -> Self {
        self.actor_field = Some(field.into());
        self
    }

    pub fn match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// How a single declared attribute value is matched.
#[derive(Debug, Clone)]
pub enum ValuePattern {
    /// `*`: matches anything, including an absent attribute.
    Wildcard,
    /// A value ending in `*`: anchored starts-with match.
    Prefix(Regex),
    /// Exact equality.
    Literal(String),
}

impl ValuePattern {
    pub fn compile(value: &str) -> Result<Self, RuleError> {
        if value == "*" {
            return Ok(ValuePattern::Wildcard);
        }
        if value.ends_with('*') {
            let regex = parse_glob(value).map_err(|e| RuleError::InvalidGlob {
                value: value.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(ValuePattern::Prefix(regex));
        }
        Ok(ValuePattern::Literal(value.to_string()))
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (ValuePattern::Wildcard, _) => true,
            (ValuePattern::Prefix(regex), Some(v)) => regex.is_match(v),
            (ValuePattern::Literal(expected), Some(v)) => expected == v,
            (_, None) => false,
        }
    }
}

/// Compile a glob value into an anchored starts-with regex.
///
/// Everything is matched literally except the first `*`, which matches any
/// run of characters. Later `*` characters are literal, never quantifiers:
/// `a*b*` matches `axb*` but not `axbbb`.
pub fn parse_glob(value: &str) -> Result<Regex, regex::Error> {
    let pattern = match value.split_once('*') {
        Some((head, tail)) => format!("^{}.*{}", regex::escape(head), regex::escape(tail)),
        None => format!("^{}", regex::escape(value)),
    };
    Regex::new(&pattern)
}

/// A compiled, validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub operation: Operation,
    pub credit_limit: i64,
    /// Zero when the rule has no credit and no interval was given.
    pub reset_seconds: i64,
    pub actor_field: Option<String>,
    pub match_policy: MatchPolicy,
    pub label: Option<String>,
    pub comment: Option<String>,
    matchers: Vec<(String, ValuePattern)>,
}

impl Rule {
    /// Whether this is the catch-all rule.
    pub fn is_default(&self) -> bool {
        self.operation.is_empty()
    }

    pub fn matches(&self, operation: &Operation) -> bool {
        self.matchers
            .iter()
            .all(|(key, pattern)| pattern.matches(operation.get(key).map(String::as_str)))
    }

    /// The actor this rule partitions quota by, for the given operation.
    pub fn actor<'a>(&self, operation: &'a Operation) -> &'a str {
        self.actor_field
            .as_ref()
            .and_then(|field| operation.get(field))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The rule label reported to metrics.
    pub fn metric_label(&self) -> &str {
        match &self.label {
            Some(label) => label,
            None if self.is_default() => "default",
            None => "rule",
        }
    }
}

/// Render an operation as `k=v k=v` for diagnostics.
pub fn describe_operation(operation: &Operation) -> String {
    let pairs: Vec<String> = operation
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{{{}}}", pairs.join(" "))
}

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The ordered, immutable set of rules a server instance runs with.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    rules: Vec<Rule>,
    labels: HashSet<String>,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from specs in precedence order and validate it.
    pub fn from_specs<I>(specs: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = RuleSpec>,
    {
        let mut store = Self::new();
        for spec in specs {
            store.add_rule(spec)?;
        }
        store.validate()?;
        Ok(store)
    }

    /// Install a rule with the lowest precedence so far.
    pub fn add_rule(&mut self, spec: RuleSpec) -> Result<(), RuleError> {
        let described = describe_operation(&spec.operation);

        if spec.match_policy == MatchPolicy::Stop {
            if let Some(existing) = self
                .rules
                .iter()
                .find(|r| r.match_policy == MatchPolicy::Stop && r.operation == spec.operation)
            {
                return Err(RuleError::UnreachableRule {
                    operation: described,
                    masked_by: describe_operation(&existing.operation),
                });
            }
        }

        let credit_limit = match spec.credit_limit.as_ref().and_then(Quantity::as_integer) {
            Some(n) if n >= 0 => n,
            _ => {
                return Err(RuleError::InvalidCreditLimit {
                    operation: described,
                    value: display_quantity(&spec.credit_limit),
                })
            }
        };

        let reset_seconds = match spec.reset_seconds.as_ref().and_then(Quantity::as_integer) {
            Some(n) if (1..=MAX_RESET_SECONDS).contains(&n) => n,
            _ if credit_limit == 0 => 0,
            _ => {
                return Err(RuleError::InvalidResetSeconds {
                    operation: described,
                    value: display_quantity(&spec.reset_seconds),
                })
            }
        };

        if let Some(label) = &spec.label {
            if !valid_label(label) {
                return Err(RuleError::InvalidLabel(label.clone()));
            }
            if self.labels.contains(label) {
                return Err(RuleError::DuplicateLabel(label.clone()));
            }
        }

        let matchers = spec
            .operation
            .iter()
            .map(|(k, v)| Ok((k.clone(), ValuePattern::compile(v)?)))
            .collect::<Result<Vec<_>, RuleError>>()?;

        let rule = Rule {
            operation: spec.operation,
            credit_limit,
            reset_seconds,
            actor_field: spec.actor_field.filter(|f| !f.is_empty()),
            match_policy: spec.match_policy,
            label: spec.label,
            comment: spec.comment.filter(|c| !c.is_empty()),
            matchers,
        };

        debug!(
            operation = %described,
            credit_limit = rule.credit_limit,
            reset_seconds = rule.reset_seconds,
            policy = ?rule.match_policy,
            label = ?rule.label,
            "Installed rule"
        );

        if let Some(label) = &rule.label {
            self.labels.insert(label.clone());
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Check that the store ends with a catch-all default rule.
    pub fn validate(&self) -> Result<(), RuleError> {
        let last = self.rules.last().ok_or(RuleError::Empty)?;
        if !last.is_default() {
            return Err(RuleError::MissingDefault(describe_operation(&last.operation)));
        }
        Ok(())
    }

    /// Find the chain of rules to evaluate for an operation.
    ///
    /// The chain holds every matching rule in precedence order, ending at the
    /// first matching `stop` rule. For a validated store the chain is never
    /// empty and always ends with a `stop` rule.
    pub fn find_rules(&self, operation: &Operation) -> Vec<&Rule> {
        let mut chain = Vec::new();
        for rule in &self.rules {
            if !rule.matches(operation) {
                continue;
            }
            chain.push(rule);
            if rule.match_policy == MatchPolicy::Stop {
                break;
            }
        }
        chain
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn display_quantity(quantity: &Option<Quantity>) -> String {
    quantity
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "missing".to_string())
}

//! Request handling: command parsing and rule-chain evaluation.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use super::dispatcher::Handler;
use crate::error::Result;
use crate::metrics::{HitStatus, Instrumenter};
use crate::protocol::{format_hit, parse_command, Command, Response};
use crate::ratelimit::{
    describe_operation, ConfigStore, CreditBackend, CreditStatus, MatchPolicy, Operation, Rule,
};

/// Resolves request lines against the rule configuration and credit backend.
pub struct DivvyService {
    config: Arc<ConfigStore>,
    backend: Arc<dyn CreditBackend>,
    instrumenter: Arc<dyn Instrumenter>,
}

impl DivvyService {
    pub fn new(
        config: Arc<ConfigStore>,
        backend: Arc<dyn CreditBackend>,
        instrumenter: Arc<dyn Instrumenter>,
    ) -> Self {
        Self {
            config,
            backend,
            instrumenter,
        }
    }

    pub fn instrumenter(&self) -> &Arc<dyn Instrumenter> {
        &self.instrumenter
    }

    /// Wrap the service as a dispatcher handler.
    pub fn into_handler(self: Arc<Self>) -> Handler {
        Arc::new(move |line: String| -> BoxFuture<'static, Result<Response>> {
            let service = self.clone();
            Box::pin(async move { service.handle_command(&line).await })
        })
    }

    /// Handle one request line.
    ///
    /// Protocol errors are answered with an `ERR` response. Backend failures
    /// are returned as errors for the dispatcher to report.
    pub async fn handle_command(&self, line: &str) -> Result<Response> {
        debug!(line = %line, "Received command");
        let start = Instant::now();

        match parse_command(line) {
            Ok(Command::Hit(operation)) => self.handle_hit(&operation, start).await,
            Err(e) => {
                let code = e.code();
                warn!(code, error = %e, "Protocol error");
                self.instrumenter.count_error(code);
                Ok(Response::protocol_error(code, &e.to_string()))
            }
        }
    }

    /// Evaluate a HIT and render the response.
    #[instrument(skip(self, operation, start), fields(operation = %describe_operation(operation)))]
    pub async fn handle_hit(&self, operation: &Operation, start: Instant) -> Result<Response> {
        let rules = self.config.find_rules(operation);
        let status = self.evaluate_rules(operation, &rules).await?;

        self.instrumenter.time_hit(start);
        Ok(Response::ok(format_hit(&status)))
    }

    /// Bill every rule in the chain, in order.
    ///
    /// Rules are evaluated one at a time: whether the next rule is consulted
    /// depends on the policy of the current one. The result of the last
    /// evaluated rule, which is always a `stop` rule for a validated config, is
    /// what the client sees.
    pub async fn evaluate_rules(
        &self,
        operation: &Operation,
        rules: &[&Rule],
    ) -> Result<CreditStatus> {
        let mut result = CreditStatus::no_credit();

        for rule in rules {
            let actor = rule.actor(operation);
            let status = self
                .backend
                .hit(&rule.operation, actor, rule.credit_limit, rule.reset_seconds)
                .await?;

            let is_canary = rule.match_policy == MatchPolicy::Canary;
            let hit_status = HitStatus::new(status.is_allowed, is_canary);
            self.instrumenter.count_hit(hit_status, rule.metric_label());

            debug!(
                rule = %describe_operation(&rule.operation),
                label = rule.metric_label(),
                comment = rule.comment.as_deref().unwrap_or(""),
                actor,
                status = %hit_status,
                credit = status.current_credit,
                "Evaluated rule"
            );

            result = status;
            if rule.match_policy == MatchPolicy::Stop {
                break;
            }
        }

        Ok(result)
    }
}

//! Reliability SLO accounting and the delegation circuit breaker.
//!
//! The dashboard evaluates the most recent N terminal delegations: success
//! rate, error rate, hard-stop rate, p95 latency and error-budget burn.
//! The breaker itself is a persisted state machine: `open` gates new
//! delegations, `half_open` is entered after five consecutive clean
//! samples, `closed` after ten (or an operator reset).

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::db::{now_epoch, HubDb};
use crate::error::ApiError;

pub const DEFAULT_WINDOW_SIZE: usize = 50;
pub const MAX_WINDOW_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SrePolicy {
    pub success_rate_slo: f64,
    pub latency_p95_ms_slo: f64,
    pub min_samples_for_enforcement: usize,
    pub error_budget_warning_ratio: f64,
    pub open_error_rate_threshold: f64,
    pub open_hard_stop_rate_threshold: f64,
    pub open_latency_multiplier: f64,
    pub half_open_success_samples: usize,
    pub close_success_samples: usize,
}

impl Default for SrePolicy {
    fn default() -> Self {
        Self {
            success_rate_slo: 0.99,
            latency_p95_ms_slo: 3000.0,
            min_samples_for_enforcement: 10,
            error_budget_warning_ratio: 0.8,
            open_error_rate_threshold: 0.30,
            open_hard_stop_rate_threshold: 0.20,
            open_latency_multiplier: 1.5,
            half_open_success_samples: 5,
            close_success_samples: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowMetrics {
    pub success_rate: f64,
    pub error_rate: f64,
    pub hard_stop_rate: f64,
    pub latency_p95_ms: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBudget {
    pub allowed_errors: i64,
    pub observed_errors: i64,
    pub remaining_errors: i64,
    pub consumed_ratio: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerReport {
    pub state: BreakerState,
    pub governance_action: &'static str,
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub severity: &'static str,
    pub code: &'static str,
    pub message: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct SloDashboard {
    pub policy: SrePolicy,
    pub window: WindowReport,
    pub metrics: WindowMetrics,
    pub error_budget: ErrorBudget,
    pub circuit_breaker: BreakerReport,
    pub alerts: Vec<Alert>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowReport {
    pub size: usize,
    pub evaluated_delegations: usize,
}

struct Sample {
    success: bool,
    hard_stop: bool,
    latency_ms: Option<f64>,
}

pub struct ReliabilityService {
    db: Arc<HubDb>,
    policy: SrePolicy,
}

impl ReliabilityService {
    pub fn new(db: Arc<HubDb>) -> Self {
        Self {
            db,
            policy: SrePolicy::default(),
        }
    }

    pub fn policy(&self) -> &SrePolicy {
        &self.policy
    }

    /// Build the SLO dashboard over the most recent `window_size` terminal
    /// delegations, advancing the persisted breaker state as a side effect.
    pub fn build_dashboard(&self, window_size: usize) -> Result<SloDashboard, ApiError> {
        let size = window_size.clamp(1, MAX_WINDOW_SIZE);
        let samples = self.window_samples(size)?;
        let total = samples.len();

        if total == 0 {
            return Ok(SloDashboard {
                policy: self.policy,
                window: WindowReport {
                    size,
                    evaluated_delegations: 0,
                },
                metrics: WindowMetrics {
                    success_rate: 1.0,
                    error_rate: 0.0,
                    hard_stop_rate: 0.0,
                    latency_p95_ms: 0.0,
                },
                error_budget: ErrorBudget {
                    allowed_errors: 1,
                    observed_errors: 0,
                    remaining_errors: 1,
                    consumed_ratio: 0.0,
                },
                circuit_breaker: BreakerReport {
                    state: self.persisted_state()?,
                    governance_action: "allow",
                    reasons: vec!["no_delegation_history".to_string()],
                },
                alerts: Vec::new(),
            });
        }

        let success_count = samples.iter().filter(|s| s.success).count();
        let error_count = total - success_count;
        let hard_stop_count = samples.iter().filter(|s| s.hard_stop).count();
        let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();

        let metrics = WindowMetrics {
            success_rate: round4(success_count as f64 / total as f64),
            error_rate: round4(error_count as f64 / total as f64),
            hard_stop_rate: round4(hard_stop_count as f64 / total as f64),
            latency_p95_ms: percentile(&latencies, 0.95),
        };

        let allowed_errors =
            ((total as f64) * (1.0 - self.policy.success_rate_slo)).floor() as i64;
        let allowed_errors = allowed_errors.max(1);
        let error_budget = ErrorBudget {
            allowed_errors,
            observed_errors: error_count as i64,
            remaining_errors: allowed_errors - error_count as i64,
            consumed_ratio: round4(error_count as f64 / allowed_errors as f64),
        };

        let circuit_breaker = self.advance_breaker(&samples, &metrics)?;
        let alerts = self.build_alerts(total, &metrics, &error_budget);

        Ok(SloDashboard {
            policy: self.policy,
            window: WindowReport {
                size,
                evaluated_delegations: total,
            },
            metrics,
            error_budget,
            circuit_breaker,
            alerts,
        })
    }

    /// Whether new delegations must be rejected right now.
    pub fn gate_open(&self) -> Result<Option<SloDashboard>, ApiError> {
        let dashboard = self.build_dashboard(DEFAULT_WINDOW_SIZE)?;
        if dashboard.circuit_breaker.state == BreakerState::Open {
            Ok(Some(dashboard))
        } else {
            Ok(None)
        }
    }

    /// Operator action: force the breaker closed. Records a watermark so
    /// enforcement evaluates only delegations that land after the reset;
    /// the pre-reset window cannot immediately re-open the breaker.
    pub fn reset(&self) -> Result<(), ApiError> {
        let conn = self.db.lock_conn();
        conn.execute(
            r#"INSERT INTO breaker_state(id, state, reset_at_epoch, updated_at_epoch)
               VALUES (1, 'closed', ?1, ?1)
               ON CONFLICT(id) DO UPDATE SET state = 'closed',
                                             reset_at_epoch = excluded.reset_at_epoch,
                                             updated_at_epoch = excluded.updated_at_epoch"#,
            [now_epoch()],
        )?;
        tracing::info!("circuit breaker reset to closed");
        Ok(())
    }

    fn advance_breaker(
        &self,
        samples: &[Sample],
        metrics: &WindowMetrics,
    ) -> Result<BreakerReport, ApiError> {
        let total = samples.len();
        let persisted = self.persisted_state()?;

        if total < self.policy.min_samples_for_enforcement {
            return Ok(BreakerReport {
                state: persisted,
                governance_action: governance_action(persisted),
                reasons: vec!["insufficient_samples".to_string()],
            });
        }

        let mut open_reasons = Vec::new();
        if metrics.error_rate >= self.policy.open_error_rate_threshold {
            open_reasons.push("error_rate_open_threshold".to_string());
        }
        if metrics.hard_stop_rate >= self.policy.open_hard_stop_rate_threshold {
            open_reasons.push("hard_stop_rate_open_threshold".to_string());
        }
        if metrics.latency_p95_ms
            > self.policy.latency_p95_ms_slo * self.policy.open_latency_multiplier
        {
            open_reasons.push("latency_critical_threshold".to_string());
        }

        // Samples are newest-first.
        let clean = |n: usize| samples.iter().take(n).all(|s| s.success) && total >= n;

        let (state, reasons) = if !open_reasons.is_empty() {
            (BreakerState::Open, open_reasons)
        } else {
            match persisted {
                BreakerState::Open => {
                    if clean(self.policy.half_open_success_samples) {
                        (
                            BreakerState::HalfOpen,
                            vec!["recent_samples_clean".to_string()],
                        )
                    } else {
                        (
                            BreakerState::Open,
                            vec!["awaiting_clean_samples".to_string()],
                        )
                    }
                }
                BreakerState::HalfOpen => {
                    if clean(self.policy.close_success_samples) {
                        (
                            BreakerState::Closed,
                            vec!["sustained_clean_samples".to_string()],
                        )
                    } else {
                        (
                            BreakerState::HalfOpen,
                            vec!["probation".to_string()],
                        )
                    }
                }
                BreakerState::Closed => (
                    BreakerState::Closed,
                    vec!["within_governance_thresholds".to_string()],
                ),
            }
        };

        if state != persisted {
            self.persist_state(state)?;
            tracing::warn!(
                from = persisted.as_str(),
                to = state.as_str(),
                error_rate = metrics.error_rate,
                hard_stop_rate = metrics.hard_stop_rate,
                "circuit breaker transition"
            );
        }

        Ok(BreakerReport {
            state,
            governance_action: governance_action(state),
            reasons,
        })
    }

    fn build_alerts(
        &self,
        total: usize,
        metrics: &WindowMetrics,
        error_budget: &ErrorBudget,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if total < self.policy.min_samples_for_enforcement {
            return alerts;
        }

        if error_budget.consumed_ratio >= 1.0 {
            alerts.push(Alert {
                severity: "critical",
                code: "error_budget.exhausted",
                message: "Delegation error budget exhausted for evaluation window.",
            });
        } else if error_budget.consumed_ratio >= self.policy.error_budget_warning_ratio {
            alerts.push(Alert {
                severity: "warning",
                code: "error_budget.burn_rate_high",
                message: "Delegation error budget burn rate is approaching exhaustion.",
            });
        }

        if metrics.latency_p95_ms
            > self.policy.latency_p95_ms_slo * self.policy.open_latency_multiplier
        {
            alerts.push(Alert {
                severity: "critical",
                code: "latency.slo_critical",
                message: "Delegation p95 latency critically exceeds SLO.",
            });
        } else if metrics.latency_p95_ms > self.policy.latency_p95_ms_slo {
            alerts.push(Alert {
                severity: "warning",
                code: "latency.slo_breach",
                message: "Delegation p95 latency exceeds SLO.",
            });
        }

        if metrics.hard_stop_rate >= self.policy.open_hard_stop_rate_threshold {
            alerts.push(Alert {
                severity: "critical",
                code: "circuit_breaker.hard_stop_rate",
                message: "Hard-stop rate exceeded circuit-breaker governance threshold.",
            });
        }

        alerts
    }

    fn window_samples(&self, size: usize) -> Result<Vec<Sample>, ApiError> {
        let conn = self.db.lock_conn();
        let reset_at: i64 = conn
            .query_row(
                "SELECT reset_at_epoch FROM breaker_state WHERE id = 1",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or(i64::MIN);

        let mut stmt = conn.prepare(
            r#"SELECT status, failure_class, latency_ms FROM delegations
               WHERE status IN ('settled', 'failed') AND created_at_epoch > ?1
               ORDER BY created_at_epoch DESC, delegation_id DESC
               LIMIT ?2"#,
        )?;
        let samples = stmt
            .query_map(rusqlite::params![reset_at, size as i64], |row| {
                let status: String = row.get(0)?;
                let failure_class: Option<String> = row.get(1)?;
                let latency_ms: Option<f64> = row.get(2)?;
                Ok(Sample {
                    success: status == "settled",
                    hard_stop: failure_class.as_deref() == Some("hard_stop_budget"),
                    latency_ms,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    fn persisted_state(&self) -> Result<BreakerState, ApiError> {
        let conn = self.db.lock_conn();
        let state: Option<String> = conn
            .query_row("SELECT state FROM breaker_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(state
            .map(|s| BreakerState::parse(&s))
            .unwrap_or(BreakerState::Closed))
    }

    fn persist_state(&self, state: BreakerState) -> Result<(), ApiError> {
        let conn = self.db.lock_conn();
        conn.execute(
            r#"INSERT INTO breaker_state(id, state, updated_at_epoch) VALUES (1, ?1, ?2)
               ON CONFLICT(id) DO UPDATE SET state = excluded.state,
                                             updated_at_epoch = excluded.updated_at_epoch"#,
            rusqlite::params![state.as_str(), now_epoch()],
        )?;
        Ok(())
    }
}

fn governance_action(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Open => "reject_new_delegations",
        _ => "allow",
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn percentile(values: &[f64], ratio: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (ratio * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    (sorted[idx] * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ReliabilityService {
        ReliabilityService::new(Arc::new(HubDb::in_memory().unwrap()))
    }

    fn seed(service: &ReliabilityService, start: usize, rows: &[(&str, Option<&str>, f64)]) {
        let conn = service.db.lock_conn();
        for (i, (status, failure_class, latency)) in rows.iter().enumerate() {
            let seq = start + i;
            conn.execute(
                r#"INSERT INTO delegations(
                       delegation_id, requester_agent_id, delegate_agent_id, task_spec,
                       estimated_cost_usd, max_budget_usd, status, stage, failure_class,
                       latency_ms, created_at_epoch, updated_at_epoch
                   ) VALUES (?1, 'agt-r', 'agt-d', 'task', 1.0, 2.0, ?2, 'feedback', ?3, ?4, ?5, ?5)"#,
                rusqlite::params![
                    format!("dlg-{seq:04}"),
                    status,
                    failure_class,
                    latency,
                    1_700_000_000_i64 + seq as i64,
                ],
            )
            .unwrap();
        }
    }

    #[test]
    fn empty_window_is_closed() {
        let service = service();
        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.circuit_breaker.state, BreakerState::Closed);
        assert_eq!(dash.window.evaluated_delegations, 0);
    }

    #[test]
    fn under_min_samples_no_enforcement() {
        let service = service();
        seed(&service, 0, &[("failed", None, 100.0); 5]);
        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.circuit_breaker.state, BreakerState::Closed);
        assert_eq!(dash.circuit_breaker.reasons, vec!["insufficient_samples"]);
    }

    #[test]
    fn error_rate_opens_breaker() {
        let service = service();
        let mut rows: Vec<(&str, Option<&str>, f64)> = vec![("settled", None, 100.0); 8];
        rows.extend(vec![("failed", None, 100.0); 4]);
        seed(&service, 0, &rows);

        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.window.evaluated_delegations, 12);
        assert!(dash.metrics.error_rate >= 0.30);
        assert_eq!(dash.circuit_breaker.state, BreakerState::Open);
        assert_eq!(dash.circuit_breaker.governance_action, "reject_new_delegations");
        assert!(service.gate_open().unwrap().is_some());
    }

    #[test]
    fn hard_stop_rate_opens_breaker() {
        let service = service();
        let mut rows: Vec<(&str, Option<&str>, f64)> = vec![("settled", None, 100.0); 8];
        rows.extend(vec![("failed", Some("hard_stop_budget"), 100.0); 2]);
        seed(&service, 0, &rows);

        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.circuit_breaker.state, BreakerState::Open);
        assert!(dash
            .circuit_breaker
            .reasons
            .contains(&"hard_stop_rate_open_threshold".to_string()));
    }

    #[test]
    fn latency_opens_breaker() {
        let service = service();
        seed(&service, 0, &[("settled", None, 10_000.0); 10]);
        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.circuit_breaker.state, BreakerState::Open);
        assert!(dash
            .circuit_breaker
            .reasons
            .contains(&"latency_critical_threshold".to_string()));
    }

    #[test]
    fn open_recovers_through_half_open_to_closed() {
        let service = service();
        let mut rows: Vec<(&str, Option<&str>, f64)> = vec![("settled", None, 100.0); 8];
        rows.extend(vec![("failed", None, 100.0); 4]);
        seed(&service, 0, &rows);
        assert_eq!(
            service.build_dashboard(50).unwrap().circuit_breaker.state,
            BreakerState::Open
        );

        // Five clean newest samples dilute the error rate below the open
        // thresholds and enter half_open.
        seed(&service, 12, &[("settled", None, 100.0); 5]);
        let dash = service.build_dashboard(50).unwrap();
        assert!(dash.metrics.error_rate < 0.30);
        assert_eq!(dash.circuit_breaker.state, BreakerState::HalfOpen);

        // Ten clean newest samples close it.
        seed(&service, 17, &[("settled", None, 100.0); 5]);
        let dash = service.build_dashboard(50).unwrap();
        assert_eq!(dash.circuit_breaker.state, BreakerState::Closed);
    }

    #[test]
    fn operator_reset_closes() {
        let service = service();
        let mut rows: Vec<(&str, Option<&str>, f64)> = vec![("settled", None, 100.0); 8];
        rows.extend(vec![("failed", None, 100.0); 4]);
        seed(&service, 0, &rows);
        assert_eq!(
            service.build_dashboard(50).unwrap().circuit_breaker.state,
            BreakerState::Open
        );

        service.reset().unwrap();
        assert!(service.gate_open().unwrap().is_none());
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&[10.0], 0.95), 10.0);
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashSet;
use metrics::counter;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationSettings;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::payment::{self, Entity as PaymentEntity};
use crate::entities::processed_event::{self, Entity as ProcessedEventEntity};
use crate::errors::ServiceError;
use crate::services::payments::PaymentsService;
use crate::services::transitions::{
    gateway_transition_for, PaymentUpdate, TransitionOutcome, TransitionRequest, TransitionService,
};
use crate::state_machine::{OrderStatus, PaymentStatus, TransitionSource};

/// What one sweep did. Returned so tests can drive sweeps directly and
/// the loop can log something more useful than "done".
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inquired: usize,
    pub transitioned: usize,
    pub timed_out: usize,
    pub completed: usize,
    pub purged_markers: u64,
}

impl SweepReport {
    fn has_activity(&self) -> bool {
        self.inquired > 0 || self.completed > 0 || self.purged_markers > 0
    }
}

enum CandidateOutcome {
    Transitioned,
    TimedOut,
    Indeterminate,
}

fn within_business_hours(settings: &ReconciliationSettings, now: DateTime<Utc>) -> bool {
    if !settings.business_hours_only {
        return true;
    }
    let hour = now.hour();
    hour >= settings.business_hours_start && hour < settings.business_hours_end
}

/// Pull-based fallback for lost gateway webhooks. Finds payments stuck
/// in awaiting-confirmation, asks the gateway directly, and drives the
/// same transition the missing webhook would have. A second leg promotes
/// long-delivered orders to completed, and expired idempotency markers
/// are purged on the way out.
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    payments: Arc<PaymentsService>,
    transitions: Arc<TransitionService>,
    settings: ReconciliationSettings,
    sweep_running: AtomicBool,
    in_flight: DashSet<String>,
}

impl ReconciliationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        payments: Arc<PaymentsService>,
        transitions: Arc<TransitionService>,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            db,
            payments,
            transitions,
            settings,
            sweep_running: AtomicBool::new(false),
            in_flight: DashSet::new(),
        }
    }

    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.settings.poller_interval_secs,
                "starting reconciliation poller"
            );
            let mut interval = tokio::time::interval(Duration::from_secs(
                self.settings.poller_interval_secs.max(1),
            ));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !within_business_hours(&self.settings, Utc::now()) {
                    debug!("outside business hours, skipping sweep");
                    continue;
                }
                match self.run_sweep_once().await {
                    Ok(report) if report.has_activity() => info!(
                        inquired = report.inquired,
                        transitioned = report.transitioned,
                        timed_out = report.timed_out,
                        completed = report.completed,
                        purged = report.purged_markers,
                        "reconciliation sweep finished"
                    ),
                    Ok(_) => {}
                    Err(e) => error!("reconciliation sweep failed: {}", e),
                }
            }
        })
    }

    /// Run one full sweep. Overlapping firings collapse into a no-op via
    /// the running guard; tests call this directly for determinism.
    pub async fn run_sweep_once(&self) -> Result<SweepReport, ServiceError> {
        if self.sweep_running.swap(true, Ordering::SeqCst) {
            info!("a sweep is already running, skipping this firing");
            return Ok(SweepReport::default());
        }
        counter!("orderflow.reconciliation.sweeps", 1);
        let result = self.sweep_inner().await;
        self.sweep_running.store(false, Ordering::SeqCst);
        result
    }

    async fn sweep_inner(&self) -> Result<SweepReport, ServiceError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let grace = chrono::Duration::minutes(self.settings.grace_minutes);
        let recency = chrono::Duration::days(self.settings.recency_days);
        let candidates = PaymentEntity::find()
            .filter(payment::Column::Status.eq(PaymentStatus::AwaitingForConfirmation.to_string()))
            .filter(payment::Column::TransactionId.is_not_null())
            .filter(payment::Column::StatusChangedAt.lt(now - grace))
            .filter(payment::Column::CreatedAt.gt(now - recency))
            .order_by_asc(payment::Column::StatusChangedAt)
            .limit(self.settings.sweep_batch)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        debug!(candidates = candidates.len(), "payments awaiting confirmation past the grace window");

        for candidate in candidates {
            let Some(transaction_id) = candidate.transaction_id.clone() else {
                continue;
            };
            if !self.in_flight.insert(transaction_id.clone()) {
                debug!(%transaction_id, "already being reconciled, skipping");
                continue;
            }
            let result = self
                .reconcile_candidate(&candidate, &transaction_id, now)
                .await;
            self.in_flight.remove(&transaction_id);

            report.inquired += 1;
            match result {
                Ok(CandidateOutcome::Transitioned) => report.transitioned += 1,
                Ok(CandidateOutcome::TimedOut) => report.timed_out += 1,
                Ok(CandidateOutcome::Indeterminate) => {}
                Err(e) => {
                    warn!(%transaction_id, error = %e, "could not reconcile candidate");
                }
            }
            sleep(Duration::from_millis(self.settings.inter_request_delay_ms)).await;
        }

        self.promote_delivered(now, &mut report).await?;

        report.purged_markers = ProcessedEventEntity::delete_many()
            .filter(processed_event::Column::ExpiresAt.lt(now))
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .rows_affected;

        Ok(report)
    }

    async fn reconcile_candidate(
        &self,
        candidate: &payment::Model,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CandidateOutcome, ServiceError> {
        let inquiry = self.payments.gateway().inquire(transaction_id).await;
        debug!(status = %inquiry.status, "gateway answered inquiry");

        if let Some((order_target, payment_target)) = gateway_transition_for(inquiry.status) {
            let outcome = self
                .transitions
                .apply(TransitionRequest {
                    order_id: candidate.order_id,
                    target: order_target,
                    source: TransitionSource::Poller,
                    external_id: transaction_id.to_owned(),
                    event_signature: inquiry.status.to_string(),
                    payment_update: Some(PaymentUpdate {
                        status: payment_target,
                        reference_number: None,
                    }),
                    shipment_update: None,
                })
                .await?;
            counter!("orderflow.reconciliation.definitive", 1);
            return Ok(match outcome {
                TransitionOutcome::NoOp { .. } => CandidateOutcome::Indeterminate,
                _ => CandidateOutcome::Transitioned,
            });
        }

        // Still pending or unknown. Past the timeout window that stops
        // being patience and becomes a lost payment.
        let deadline =
            candidate.created_at + chrono::Duration::hours(self.settings.awaiting_timeout_hours);
        if now > deadline {
            warn!(
                order_id = %candidate.order_id,
                %transaction_id,
                "no definitive gateway answer within the timeout window, failing the payment"
            );
            let outcome = self
                .transitions
                .apply(TransitionRequest {
                    order_id: candidate.order_id,
                    target: OrderStatus::Cancelled,
                    source: TransitionSource::Poller,
                    external_id: transaction_id.to_owned(),
                    event_signature: "timeout".to_owned(),
                    payment_update: Some(PaymentUpdate {
                        status: PaymentStatus::Failed,
                        reference_number: None,
                    }),
                    shipment_update: None,
                })
                .await?;
            counter!("orderflow.reconciliation.timed_out", 1);
            return Ok(match outcome {
                TransitionOutcome::NoOp { .. } => CandidateOutcome::Indeterminate,
                _ => CandidateOutcome::TimedOut,
            });
        }

        Ok(CandidateOutcome::Indeterminate)
    }

    /// Orders that sat in `delivered` for the configured window move to
    /// `completed` without waiting for anyone to confirm.
    async fn promote_delivered(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ServiceError> {
        let window = chrono::Duration::hours(self.settings.completion_hours);
        let due = OrderEntity::find()
            .filter(order::Column::Status.eq(OrderStatus::Delivered.to_string()))
            .filter(order::Column::UpdatedAt.lt(now - window))
            .limit(self.settings.sweep_batch)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        for order in due {
            let outcome = self
                .transitions
                .apply(TransitionRequest {
                    order_id: order.id,
                    target: OrderStatus::Completed,
                    source: TransitionSource::Poller,
                    external_id: order.id.to_string(),
                    event_signature: "auto_complete".to_owned(),
                    payment_update: None,
                    shipment_update: None,
                })
                .await;
            match outcome {
                Ok(TransitionOutcome::Applied { .. }) => {
                    counter!("orderflow.reconciliation.completed", 1);
                    report.completed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(order_id = %order.id, error = %e, "auto-completion failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings(business_hours_only: bool) -> ReconciliationSettings {
        ReconciliationSettings {
            poller_interval_secs: 300,
            grace_minutes: 15,
            recency_days: 30,
            awaiting_timeout_hours: 72,
            completion_hours: 72,
            sweep_batch: 100,
            inter_request_delay_ms: 0,
            business_hours_only,
            business_hours_start: 8,
            business_hours_end: 20,
        }
    }

    #[test]
    fn business_hours_gate_is_off_by_default() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
        assert!(within_business_hours(&settings(false), at));
    }

    #[test]
    fn business_hours_gate_brackets_the_day() {
        let cfg = settings(true);
        let hour = |h| Utc.with_ymd_and_hms(2024, 6, 1, h, 30, 0).unwrap();
        assert!(!within_business_hours(&cfg, hour(7)));
        assert!(within_business_hours(&cfg, hour(8)));
        assert!(within_business_hours(&cfg, hour(19)));
        assert!(!within_business_hours(&cfg, hour(20)));
    }

    #[test]
    fn empty_report_has_no_activity() {
        assert!(!SweepReport::default().has_activity());
        let report = SweepReport {
            inquired: 1,
            ..Default::default()
        };
        assert!(report.has_activity());
    }
}

//! Quota reservation, settlement and refund.
//!
//! A reservation is taken inline against the ledger with a floor check so an
//! underfunded caller is rejected before dispatch. The returned
//! [`QuotaReservation`] must then be consumed exactly once, either by
//! [`QuotaReservation::settle`] or [`QuotaReservation::refund`]. Both push
//! their deltas into the [`DeltaAccumulator`]; neither writes the ledger
//! inline. A reservation dropped without being consumed refunds itself.

use crate::accumulator::DeltaAccumulator;
use gateway_core::{
    CallerIdentity, ChannelId, DeltaKind, GatewayResult, Ledger, QuotaAccount,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process-wide reservation counters
#[derive(Debug, Default)]
pub struct QuotaCounters {
    reserved: AtomicU64,
    settled: AtomicU64,
    refunded: AtomicU64,
}

impl QuotaCounters {
    /// Reservations taken
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Reservations settled
    pub fn settled(&self) -> u64 {
        self.settled.load(Ordering::Relaxed)
    }

    /// Reservations refunded
    pub fn refunded(&self) -> u64 {
        self.refunded.load(Ordering::Relaxed)
    }

    /// Reservations neither settled nor refunded yet
    pub fn outstanding(&self) -> u64 {
        self.reserved()
            .saturating_sub(self.settled() + self.refunded())
    }
}

/// Result of settling a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Quota reserved before dispatch
    pub estimate: i64,
    /// Quota owed for reported usage
    pub actual: i64,
    /// `actual - estimate`; positive charges more, negative gives back
    pub delta: i64,
}

/// Reserves and reconciles caller quota
#[derive(Clone)]
pub struct QuotaService {
    ledger: Arc<dyn Ledger>,
    accumulator: Arc<DeltaAccumulator>,
    counters: Arc<QuotaCounters>,
}

impl std::fmt::Debug for QuotaService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaService")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl QuotaService {
    /// Create a service over `ledger`, deferring writes through `accumulator`
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, accumulator: Arc<DeltaAccumulator>) -> Self {
        Self {
            ledger,
            accumulator,
            counters: Arc::new(QuotaCounters::default()),
        }
    }

    /// Shared accumulator
    #[must_use]
    pub fn accumulator(&self) -> &Arc<DeltaAccumulator> {
        &self.accumulator
    }

    /// Reservation counters
    #[must_use]
    pub fn counters(&self) -> &Arc<QuotaCounters> {
        &self.counters
    }

    /// Take `amount` from the caller before dispatch.
    ///
    /// Limited tokens are charged first, then the user. Either balance going
    /// negative fails with `InsufficientQuota` and leaves both untouched.
    /// Unlimited tokens skip the token balance and the user floor.
    pub async fn reserve(
        &self,
        caller: &CallerIdentity,
        amount: i64,
    ) -> GatewayResult<QuotaReservation> {
        let amount = amount.max(0);

        if amount > 0 {
            if caller.unlimited_quota {
                self.ledger
                    .decrease_with_floor(QuotaAccount::User(caller.user_id), amount, false)
                    .await?;
            } else {
                self.ledger
                    .decrease_with_floor(QuotaAccount::Token(caller.token_id), amount, true)
                    .await?;

                if let Err(e) = self
                    .ledger
                    .decrease_with_floor(QuotaAccount::User(caller.user_id), amount, true)
                    .await
                {
                    if let Err(undo) = self
                        .ledger
                        .decrease_with_floor(QuotaAccount::Token(caller.token_id), -amount, false)
                        .await
                    {
                        warn!(
                            token_id = caller.token_id,
                            amount = amount,
                            error = %undo,
                            "Failed to return token quota inline, deferring"
                        );
                        self.accumulator
                            .add(DeltaKind::TokenQuota, caller.token_id, amount);
                    }
                    return Err(e);
                }
            }
        }

        self.counters.reserved.fetch_add(1, Ordering::Relaxed);
        debug!(
            user_id = caller.user_id,
            token_id = caller.token_id,
            quota = amount,
            "Quota reserved"
        );

        Ok(QuotaReservation {
            state: Some(Held {
                caller: caller.clone(),
                amount,
                accumulator: Arc::clone(&self.accumulator),
                counters: Arc::clone(&self.counters),
            }),
        })
    }
}

struct Held {
    caller: CallerIdentity,
    amount: i64,
    accumulator: Arc<DeltaAccumulator>,
    counters: Arc<QuotaCounters>,
}

impl Held {
    fn adjust_balances(&self, delta: i64) {
        self.accumulator
            .add(DeltaKind::UserQuota, self.caller.user_id, delta);
        if !self.caller.unlimited_quota {
            self.accumulator
                .add(DeltaKind::TokenQuota, self.caller.token_id, delta);
        }
    }

    fn refund(self) -> i64 {
        self.adjust_balances(self.amount);
        self.counters.refunded.fetch_add(1, Ordering::Relaxed);
        self.amount
    }
}

/// Quota held for one in-flight request
pub struct QuotaReservation {
    state: Option<Held>,
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("amount", &self.amount())
            .finish()
    }
}

impl QuotaReservation {
    /// Quota held
    #[must_use]
    pub fn amount(&self) -> i64 {
        self.state.as_ref().map_or(0, |s| s.amount)
    }

    /// Reconcile to `actual` cost and count the request against the channel
    pub fn settle(mut self, actual: i64, channel_id: ChannelId) -> Settlement {
        let Some(held) = self.state.take() else {
            return Settlement {
                estimate: 0,
                actual: 0,
                delta: 0,
            };
        };

        let delta = actual - held.amount;
        held.adjust_balances(-delta);

        let user_id = held.caller.user_id;
        held.accumulator.add(DeltaKind::UsedQuota, user_id, actual);
        held.accumulator.add(DeltaKind::RequestCount, user_id, 1);
        held.accumulator
            .add(DeltaKind::ChannelUsedQuota, channel_id, actual);
        held.counters.settled.fetch_add(1, Ordering::Relaxed);

        debug!(
            user_id = user_id,
            channel_id = channel_id,
            estimate = held.amount,
            actual = actual,
            delta = delta,
            "Quota settled"
        );

        Settlement {
            estimate: held.amount,
            actual,
            delta,
        }
    }

    /// Give the whole reservation back; returns the amount refunded
    pub fn refund(mut self) -> i64 {
        match self.state.take() {
            Some(held) => {
                let user_id = held.caller.user_id;
                let amount = held.refund();
                debug!(user_id = user_id, quota = amount, "Quota refunded");
                amount
            }
            None => 0,
        }
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if let Some(held) = self.state.take() {
            warn!(
                user_id = held.caller.user_id,
                quota = held.amount,
                "Reservation dropped without settlement, refunding"
            );
            held.refund();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use gateway_core::GatewayError;

    const USER: i64 = 7;
    const TOKEN: i64 = 70;

    fn setup(user_quota: i64, token_quota: i64, unlimited: bool) -> (Arc<InMemoryLedger>, QuotaService) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.insert_user(USER, user_quota, "default");
        ledger.insert_token("sk-test", TOKEN, USER, token_quota, unlimited);
        let accumulator = Arc::new(DeltaAccumulator::new(ledger.clone()));
        let service = QuotaService::new(ledger.clone(), accumulator);
        (ledger, service)
    }

    fn caller(unlimited: bool) -> CallerIdentity {
        CallerIdentity::new(USER, TOKEN).with_unlimited_quota(unlimited)
    }

    async fn balances(ledger: &InMemoryLedger) -> (i64, i64) {
        (
            ledger.balance(QuotaAccount::User(USER)).await.unwrap(),
            ledger.balance(QuotaAccount::Token(TOKEN)).await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_reserve_then_settle_higher_cost() {
        let (ledger, service) = setup(10_000, 5_000, false);
        let reservation = service.reserve(&caller(false), 1_000).await.unwrap();
        assert_eq!(balances(&ledger).await, (9_000, 4_000));

        let settlement = reservation.settle(1_200, 3);
        assert_eq!(settlement.delta, 200);

        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (8_800, 3_800));
        assert_eq!(ledger.used_quota(USER), 1_200);
        assert_eq!(ledger.request_count(USER), 1);
        assert_eq!(ledger.channel_used_quota(3), 1_200);
        assert_eq!(service.counters().settled(), 1);
        assert_eq!(service.counters().refunded(), 0);
    }

    #[tokio::test]
    async fn test_settle_lower_cost_gives_difference_back() {
        let (ledger, service) = setup(10_000, 5_000, false);
        let reservation = service.reserve(&caller(false), 1_000).await.unwrap();
        let settlement = reservation.settle(300, 1);
        assert_eq!(settlement.delta, -700);

        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (9_700, 4_700));
    }

    #[tokio::test]
    async fn test_insufficient_token_quota_rejects_without_charge() {
        let (ledger, service) = setup(10_000, 100, false);
        let err = service.reserve(&caller(false), 1_000).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota { .. }));
        assert_eq!(balances(&ledger).await, (10_000, 100));
        assert_eq!(service.counters().reserved(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_user_quota_returns_token_charge() {
        let (ledger, service) = setup(500, 5_000, false);
        let err = service.reserve(&caller(false), 1_000).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota { .. }));
        assert_eq!(balances(&ledger).await, (500, 5_000));
    }

    #[tokio::test]
    async fn test_unlimited_token_is_not_floored() {
        let (ledger, service) = setup(100, 0, true);
        let reservation = service.reserve(&caller(true), 1_000).await.unwrap();
        assert_eq!(balances(&ledger).await, (-900, 0));

        reservation.refund();
        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (100, 0));
    }

    #[tokio::test]
    async fn test_refund_restores_full_reservation() {
        let (ledger, service) = setup(10_000, 5_000, false);
        let reservation = service.reserve(&caller(false), 1_000).await.unwrap();
        assert_eq!(reservation.refund(), 1_000);

        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (10_000, 5_000));
        assert_eq!(ledger.request_count(USER), 0);
        assert_eq!(service.counters().refunded(), 1);
        assert_eq!(service.counters().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropped_reservation_refunds_once() {
        let (ledger, service) = setup(10_000, 5_000, false);
        {
            let _reservation = service.reserve(&caller(false), 250).await.unwrap();
        }
        assert_eq!(service.counters().refunded(), 1);
        assert_eq!(service.counters().settled(), 0);

        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (10_000, 5_000));
    }

    #[tokio::test]
    async fn test_zero_reservation_never_touches_ledger() {
        let (ledger, service) = setup(0, 0, false);
        let reservation = service.reserve(&caller(false), 0).await.unwrap();
        let settlement = reservation.settle(0, 1);
        assert_eq!(settlement.delta, 0);
        assert_eq!(service.counters().settled(), 1);

        service.accumulator().flush().await;
        assert_eq!(balances(&ledger).await, (0, 0));
        assert_eq!(ledger.request_count(USER), 1);
    }
}

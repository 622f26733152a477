use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{
    CollaboratorError, DiscountCode, DiscountCodeId, DiscountCodeUpdate, DiscountUsage,
    NewDiscountCode, PromoCode, Promotions, RedemptionError, RedemptionId, RedemptionRecord, RedemptionRequest, Timestamp,
    UserId, ValidationError,
};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from administering discount codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromotionsAdminError {
    /// A code with the same (normalized) string exists.
    #[error("discount code {0} already exists")]
    DuplicateCode(PromoCode),

    /// No code with that string exists.
    #[error("discount code {0} not found")]
    NotFound(PromoCode),

    /// The code definition is invalid.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

#[derive(Default)]
struct PromotionsState {
    codes: HashMap<DiscountCodeId, DiscountCode>,
    by_code: HashMap<PromoCode, DiscountCodeId>,
    redemptions: Vec<RedemptionRecord>,
}

/// In-memory promotions collaborator.
///
/// Redemption is a compare-and-swap on the code version: the count,
/// version and redemption record change together under one write lock.
#[derive(Clone, Default)]
pub struct InMemoryPromotions {
    state: Arc<RwLock<PromotionsState>>,
}

impl InMemoryPromotions {
    /// Creates an empty promotions store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a discount code. Code strings are unique after upper-casing.
    #[instrument(name = "memory.promotions.create_code", skip_all, fields(code = %new.code))]
    pub fn create_code(&self, new: NewDiscountCode) -> Result<DiscountCode, PromotionsAdminError> {
        let mut state = self.state.write();
        if state.by_code.contains_key(&new.code) {
            return Err(PromotionsAdminError::DuplicateCode(new.code));
        }
        let code = DiscountCode::create(DiscountCodeId::generate(), new)?;
        state.by_code.insert(code.code().clone(), code.id());
        state.codes.insert(code.id(), code.clone());
        debug!(code_id = %code.id(), "[memory.promotions.create_code] code created");
        Ok(code)
    }

    /// Looks up one code.
    pub fn code(&self, code: &PromoCode) -> Option<DiscountCode> {
        let state = self.state.read();
        state
            .by_code
            .get(code)
            .and_then(|id| state.codes.get(id))
            .cloned()
    }

    /// Applies an administrator's changes to a code.
    #[instrument(name = "memory.promotions.update_code", skip_all, fields(code = %code))]
    pub fn update_code(
        &self,
        code: &PromoCode,
        update: DiscountCodeUpdate,
    ) -> Result<DiscountCode, PromotionsAdminError> {
        let mut state = self.state.write();
        let id = *state
            .by_code
            .get(code)
            .ok_or_else(|| PromotionsAdminError::NotFound(code.clone()))?;
        let record = state
            .codes
            .get_mut(&id)
            .ok_or_else(|| PromotionsAdminError::NotFound(code.clone()))?;
        record.apply_update(update)?;
        debug!(version = record.version(), "[memory.promotions.update_code] code updated");
        Ok(record.clone())
    }

    /// Switches a code on or off.
    pub fn set_active(&self, code: &PromoCode, active: bool) -> Option<DiscountCode> {
        let mut state = self.state.write();
        let id = *state.by_code.get(code)?;
        let record = state.codes.get_mut(&id)?;
        record.set_active(active);
        Some(record.clone())
    }

    /// Every code, ordered by code string.
    pub fn codes(&self) -> Vec<DiscountCode> {
        let mut codes: Vec<_> = self.state.read().codes.values().cloned().collect();
        codes.sort_by(|a, b| a.code().cmp(b.code()));
        codes
    }

    /// Usage statistics for one code.
    pub fn usage(&self, code: &PromoCode) -> Option<DiscountUsage> {
        let state = self.state.read();
        let id = state.by_code.get(code)?;
        let record = state.codes.get(id)?;
        Some(record.usage(&state.redemptions))
    }

    /// Every redemption recorded so far.
    pub fn all_redemptions(&self) -> Vec<RedemptionRecord> {
        self.state.read().redemptions.clone()
    }
}

#[async_trait]
impl Promotions for InMemoryPromotions {
    async fn find_code(&self, code: &PromoCode) -> Result<Option<DiscountCode>, CollaboratorError> {
        let state = self.state.read();
        Ok(state
            .by_code
            .get(code)
            .and_then(|id| state.codes.get(id))
            .cloned())
    }

    async fn redemptions(
        &self,
        user_id: &UserId,
        code_id: DiscountCodeId,
    ) -> Result<Vec<RedemptionRecord>, CollaboratorError> {
        Ok(self
            .state
            .read()
            .redemptions
            .iter()
            .filter(|record| record.code_id == code_id && &record.user_id == user_id)
            .cloned()
            .collect())
    }

    #[instrument(name = "memory.promotions.redeem", skip_all, fields(code_id = %request.code_id, expected_version = request.expected_version))]
    async fn redeem(&self, request: RedemptionRequest) -> Result<RedemptionRecord, RedemptionError> {
        let mut state = self.state.write();
        let already_redeemed = state
            .redemptions
            .iter()
            .any(|record| record.code_id == request.code_id && record.user_id == request.user_id);

        let code = state
            .codes
            .get_mut(&request.code_id)
            .ok_or(RedemptionError::UnknownCode)?;
        if code.version() != request.expected_version {
            return Err(RedemptionError::VersionConflict {
                expected: request.expected_version,
                actual: code.version(),
            });
        }
        if already_redeemed {
            return Err(RedemptionError::AlreadyRedeemed);
        }
        if !code.consume_redemption() {
            return Err(RedemptionError::LimitReached);
        }

        let record = RedemptionRecord {
            id: RedemptionId::generate(),
            user_id: request.user_id,
            code_id: request.code_id,
            order_id: request.order_id,
            amount: request.amount,
            redeemed_at: Timestamp::now(),
        };
        state.redemptions.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use orderflow::{DiscountKind, Money, OrderId};
    use rust_decimal_macros::dec;

    fn new_code(code: &str, max_redemptions: u32) -> NewDiscountCode {
        NewDiscountCode {
            code: PromoCode::try_new(code).unwrap(),
            description: String::new(),
            kind: DiscountKind::Fixed,
            value: dec!(50),
            minimum_subtotal: Money::ZERO,
            max_redemptions,
            starts_at: Timestamp::new(Utc::now() - Duration::days(1)),
            ends_at: Timestamp::new(Utc::now() + Duration::days(1)),
            active: true,
        }
    }

    fn request(code: &DiscountCode, user: &str, version: u64) -> RedemptionRequest {
        RedemptionRequest {
            code_id: code.id(),
            expected_version: version,
            user_id: UserId::try_new(user).unwrap(),
            order_id: OrderId::generate(),
            amount: Money::from_cents(5_000).unwrap(),
        }
    }

    #[test]
    fn codes_are_normalized_and_unique() {
        let promotions = InMemoryPromotions::new();
        let created = promotions.create_code(new_code("summer50", 10)).unwrap();
        assert_eq!(created.code().as_ref(), "SUMMER50");

        let error = promotions.create_code(new_code("Summer50", 10)).unwrap_err();
        assert!(matches!(error, PromotionsAdminError::DuplicateCode(_)));
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let promotions = InMemoryPromotions::new();
        promotions.create_code(new_code("SUMMER50", 10)).unwrap();

        let found = promotions
            .find_code(&PromoCode::try_new("summer50").unwrap())
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn redeem_bumps_count_and_version() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("SUMMER50", 10)).unwrap();

        promotions.redeem(request(&code, "alice", 0)).await.unwrap();

        let after = promotions.find_code(code.code()).await.unwrap().unwrap();
        assert_eq!(after.redemption_count(), 1);
        assert_eq!(after.version(), 1);
        assert_eq!(
            promotions
                .redemptions(&UserId::try_new("alice").unwrap(), code.id())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("SUMMER50", 10)).unwrap();
        promotions.redeem(request(&code, "alice", 0)).await.unwrap();

        let error = promotions.redeem(request(&code, "bob", 0)).await.unwrap_err();
        assert_eq!(
            error,
            RedemptionError::VersionConflict {
                expected: 0,
                actual: 1
            }
        );
        promotions.redeem(request(&code, "bob", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn same_user_cannot_redeem_twice() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("SUMMER50", 10)).unwrap();
        promotions.redeem(request(&code, "alice", 0)).await.unwrap();

        let error = promotions.redeem(request(&code, "alice", 1)).await.unwrap_err();
        assert_eq!(error, RedemptionError::AlreadyRedeemed);
    }

    #[tokio::test]
    async fn limit_is_never_exceeded() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("ONCE", 1)).unwrap();
        promotions.redeem(request(&code, "alice", 0)).await.unwrap();

        let error = promotions.redeem(request(&code, "bob", 1)).await.unwrap_err();
        assert_eq!(error, RedemptionError::LimitReached);
    }

    #[tokio::test]
    async fn concurrent_redemptions_respect_the_limit() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("RACE", 3)).unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let promotions = promotions.clone();
            let code_id = code.id();
            handles.push(tokio::spawn(async move {
                // retry conflicts the way the orchestrator does
                for _ in 0..20 {
                    let current = promotions
                        .state
                        .read()
                        .codes
                        .get(&code_id)
                        .map(DiscountCode::version)
                        .unwrap();
                    let request = RedemptionRequest {
                        code_id,
                        expected_version: current,
                        user_id: UserId::try_new(format!("user-{i}")).unwrap(),
                        order_id: OrderId::generate(),
                        amount: Money::from_cents(100).unwrap(),
                    };
                    match promotions.redeem(request).await {
                        Err(RedemptionError::VersionConflict { .. }) => {}
                        other => return other.is_ok(),
                    }
                }
                false
            }));
        }

        let successes = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();
        assert_eq!(successes, 3);
        assert_eq!(promotions.usage(code.code()).unwrap().total_uses, 3);
    }

    #[tokio::test]
    async fn update_bumps_version_and_stales_pending_redemptions() {
        // Given a code read at version 0
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("SUMMER50", 10)).unwrap();

        // When an administrator raises the limit
        let updated = promotions
            .update_code(
                code.code(),
                DiscountCodeUpdate {
                    max_redemptions: Some(20),
                    ..DiscountCodeUpdate::default()
                },
            )
            .unwrap();

        // Then a redemption against the old version conflicts
        assert_eq!(updated.max_redemptions(), 20);
        assert_eq!(promotions.code(code.code()), Some(updated));
        let error = promotions.redeem(request(&code, "alice", 0)).await.unwrap_err();
        assert!(matches!(error, RedemptionError::VersionConflict { actual: 1, .. }));
    }

    #[test]
    fn updating_a_missing_code_is_not_found() {
        let promotions = InMemoryPromotions::new();
        let error = promotions
            .update_code(
                &PromoCode::try_new("NOPE").unwrap(),
                DiscountCodeUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(error, PromotionsAdminError::NotFound(_)));
        assert!(promotions.code(&PromoCode::try_new("NOPE").unwrap()).is_none());
    }

    #[test]
    fn usage_reports_discount_granted() {
        let promotions = InMemoryPromotions::new();
        let code = promotions.create_code(new_code("SUMMER50", 4)).unwrap();
        let usage = promotions.usage(code.code()).unwrap();
        assert_eq!(usage.total_uses, 0);
        assert_eq!(usage.max_uses, 4);
        assert_eq!(usage.total_discount, Money::ZERO);
    }
}

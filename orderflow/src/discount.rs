//! Discount code evaluation.
//!
//! [`evaluate`] is pure: it receives the code record, the user's existing
//! redemptions and the current time, and performs no I/O.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::types::{DiscountCodeId, Money, OrderId, PromoCode, RedemptionId, Timestamp, UserId};

/// How a discount value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    /// `value` is a percentage of the subtotal.
    Percentage,
    /// `value` is a fixed amount off.
    Fixed,
}

impl fmt::Display for DiscountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentage => f.write_str("percentage"),
            Self::Fixed => f.write_str("fixed"),
        }
    }
}

/// Changes to an existing discount code. Absent fields stay as they are.
///
/// The code string, kind and value are fixed once customers may have
/// redeemed the code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCodeUpdate {
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New redemption limit.
    #[serde(default)]
    pub max_redemptions: Option<u32>,
    /// New end of the active window.
    #[serde(default)]
    pub ends_at: Option<Timestamp>,
    /// Switch the code on or off.
    #[serde(default)]
    pub active: Option<bool>,
}

/// Fields supplied when creating a discount code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDiscountCode {
    /// Code string customers type.
    pub code: PromoCode,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Percentage or fixed.
    pub kind: DiscountKind,
    /// Percent (0..=100) or fixed amount.
    pub value: Decimal,
    /// Minimum subtotal the code applies to.
    #[serde(default)]
    pub minimum_subtotal: Money,
    /// Maximum redemptions across all users.
    pub max_redemptions: u32,
    /// Start of the active window (inclusive).
    pub starts_at: Timestamp,
    /// End of the active window (exclusive).
    pub ends_at: Timestamp,
    /// Whether the code is switched on.
    #[serde(default = "enabled")]
    pub active: bool,
}

const fn enabled() -> bool {
    true
}

/// A promotional discount code record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCode {
    id: DiscountCodeId,
    code: PromoCode,
    description: String,
    kind: DiscountKind,
    value: Decimal,
    minimum_subtotal: Money,
    max_redemptions: u32,
    redemption_count: u32,
    starts_at: Timestamp,
    ends_at: Timestamp,
    active: bool,
    version: u64,
}

impl DiscountCode {
    /// Validates and creates a code with no redemptions at version 0.
    pub fn create(id: DiscountCodeId, new: NewDiscountCode) -> Result<Self, ValidationError> {
        if new.value.is_sign_negative() && !new.value.is_zero() {
            return Err(ValidationError::field("value", "must not be negative"));
        }
        match new.kind {
            DiscountKind::Percentage if new.value > Decimal::ONE_HUNDRED => {
                return Err(ValidationError::field("value", "percentage cannot exceed 100"));
            }
            DiscountKind::Fixed => {
                Money::new(new.value)?;
            }
            DiscountKind::Percentage => {}
        }
        if new.ends_at <= new.starts_at {
            return Err(ValidationError::field("ends_at", "must be after starts_at"));
        }

        Ok(Self {
            id,
            code: new.code,
            description: new.description,
            kind: new.kind,
            value: new.value,
            minimum_subtotal: new.minimum_subtotal,
            max_redemptions: new.max_redemptions,
            redemption_count: 0,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            active: new.active,
            version: 0,
        })
    }

    /// Identity.
    pub const fn id(&self) -> DiscountCodeId {
        self.id
    }

    /// Normalized code string.
    pub const fn code(&self) -> &PromoCode {
        &self.code
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Percentage or fixed.
    pub const fn kind(&self) -> DiscountKind {
        self.kind
    }

    /// Percent or fixed amount.
    pub const fn value(&self) -> Decimal {
        self.value
    }

    /// Minimum qualifying subtotal.
    pub const fn minimum_subtotal(&self) -> Money {
        self.minimum_subtotal
    }

    /// Maximum redemptions across all users.
    pub const fn max_redemptions(&self) -> u32 {
        self.max_redemptions
    }

    /// Redemptions recorded so far.
    pub const fn redemption_count(&self) -> u32 {
        self.redemption_count
    }

    /// Active window start (inclusive).
    pub const fn starts_at(&self) -> Timestamp {
        self.starts_at
    }

    /// Active window end (exclusive).
    pub const fn ends_at(&self) -> Timestamp {
        self.ends_at
    }

    /// Whether the code is switched on.
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Optimistic concurrency version, bumped on every redemption.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// True while redemptions remain.
    pub const fn has_remaining_redemptions(&self) -> bool {
        self.redemption_count < self.max_redemptions
    }

    /// Consumes one redemption and bumps the version.
    ///
    /// Returns `false` without changing anything when the limit is reached.
    pub fn consume_redemption(&mut self) -> bool {
        if !self.has_remaining_redemptions() {
            return false;
        }
        self.redemption_count += 1;
        self.version += 1;
        true
    }

    /// Switches the code on or off, bumping the version.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.version += 1;
    }

    /// Applies an administrator's changes and bumps the version.
    ///
    /// Nothing changes when the update is invalid.
    pub fn apply_update(&mut self, update: DiscountCodeUpdate) -> Result<(), ValidationError> {
        if update
            .max_redemptions
            .is_some_and(|max| max < self.redemption_count)
        {
            return Err(ValidationError::field(
                "max_redemptions",
                "cannot be below the redemptions already recorded",
            ));
        }
        if update.ends_at.is_some_and(|ends_at| ends_at <= self.starts_at) {
            return Err(ValidationError::field("ends_at", "must be after starts_at"));
        }

        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(max) = update.max_redemptions {
            self.max_redemptions = max;
        }
        if let Some(ends_at) = update.ends_at {
            self.ends_at = ends_at;
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        self.version += 1;
        Ok(())
    }

    /// Usage statistics given every redemption recorded against this code.
    pub fn usage(&self, redemptions: &[RedemptionRecord]) -> DiscountUsage {
        let total_discount = redemptions
            .iter()
            .filter(|record| record.code_id == self.id)
            .map(|record| record.amount)
            .sum();
        let usage_percent = if self.max_redemptions == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(self.redemption_count) * Decimal::ONE_HUNDRED
                / Decimal::from(self.max_redemptions))
            .round_dp(2)
        };

        DiscountUsage {
            code: self.code.clone(),
            total_uses: self.redemption_count,
            max_uses: self.max_redemptions,
            usage_percent,
            total_discount,
            active: self.active,
        }
    }
}

/// Usage statistics for one discount code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountUsage {
    /// The code.
    pub code: PromoCode,
    /// Redemptions so far.
    pub total_uses: u32,
    /// Redemption limit.
    pub max_uses: u32,
    /// `total_uses / max_uses` as a percentage.
    pub usage_percent: Decimal,
    /// Sum of discount granted through this code.
    pub total_discount: Money,
    /// Whether the code is switched on.
    pub active: bool,
}

/// One use of a discount code by one user for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    /// Identity.
    pub id: RedemptionId,
    /// Who redeemed.
    pub user_id: UserId,
    /// Which code.
    pub code_id: DiscountCodeId,
    /// Which order.
    pub order_id: OrderId,
    /// Discount actually applied.
    pub amount: Money,
    /// When.
    pub redeemed_at: Timestamp,
}

/// Why a discount code did not apply.
///
/// Variants are declared in the order the checks run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DiscountRejection {
    /// No code with this string exists.
    NotFound,
    /// The code is switched off.
    Inactive,
    /// The active window has not started.
    NotYetActive {
        /// Window start.
        starts_at: Timestamp,
    },
    /// The active window has ended.
    Expired {
        /// Window end.
        ended_at: Timestamp,
    },
    /// All redemptions are used up.
    LimitReached,
    /// The subtotal is below the code's minimum.
    BelowMinimumSubtotal {
        /// Required minimum.
        minimum: Money,
    },
    /// This user already redeemed the code.
    AlreadyUsed,
}

impl fmt::Display for DiscountRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("discount code not found"),
            Self::Inactive => f.write_str("discount code is not active"),
            Self::NotYetActive { .. } => f.write_str("discount code is not active yet"),
            Self::Expired { .. } => f.write_str("discount code has expired"),
            Self::LimitReached => f.write_str("discount code usage limit reached"),
            Self::BelowMinimumSubtotal { minimum } => {
                write!(f, "minimum order amount for this code is {minimum}")
            }
            Self::AlreadyUsed => f.write_str("discount code already used"),
        }
    }
}

/// A discount that passed every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    /// Code identity.
    pub code_id: DiscountCodeId,
    /// Code string.
    pub code: PromoCode,
    /// Percentage or fixed.
    pub kind: DiscountKind,
    /// Amount off, already clamped to the subtotal.
    pub amount: Money,
    /// Code version observed during evaluation.
    pub code_version: u64,
}

/// Result of [`evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscountEvaluation {
    /// The code applies.
    Applied(AppliedDiscount),
    /// The code does not apply.
    Rejected(DiscountRejection),
}

impl DiscountEvaluation {
    /// True when the code applies.
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Rejection reason, if any.
    pub const fn reason(&self) -> Option<&DiscountRejection> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected(reason) => Some(reason),
        }
    }

    /// Amount off; zero when rejected.
    pub const fn discount_amount(&self) -> Money {
        match self {
            Self::Applied(applied) => applied.amount,
            Self::Rejected(_) => Money::ZERO,
        }
    }

    /// Kind of the applied discount.
    pub const fn kind(&self) -> Option<DiscountKind> {
        match self {
            Self::Applied(applied) => Some(applied.kind),
            Self::Rejected(_) => None,
        }
    }
}

/// Decides whether `code` applies to `user_id`'s cart at `now`.
///
/// Checks run in a fixed order and the first failure wins: existence, active
/// flag, window start, window end, remaining redemptions, minimum subtotal,
/// and finally whether the user already redeemed it.
pub fn evaluate(
    code: Option<&DiscountCode>,
    user_id: &UserId,
    subtotal: Money,
    redemptions: &[RedemptionRecord],
    now: Timestamp,
) -> DiscountEvaluation {
    match check(code, user_id, subtotal, redemptions, now) {
        Ok(code) => DiscountEvaluation::Applied(AppliedDiscount {
            code_id: code.id,
            code: code.code.clone(),
            kind: code.kind,
            amount: compute_discount(code.kind, code.value, subtotal),
            code_version: code.version,
        }),
        Err(rejection) => DiscountEvaluation::Rejected(rejection),
    }
}

fn check<'a>(
    code: Option<&'a DiscountCode>,
    user_id: &UserId,
    subtotal: Money,
    redemptions: &[RedemptionRecord],
    now: Timestamp,
) -> Result<&'a DiscountCode, DiscountRejection> {
    let code = code.ok_or(DiscountRejection::NotFound)?;
    if !code.active {
        return Err(DiscountRejection::Inactive);
    }
    if now < code.starts_at {
        return Err(DiscountRejection::NotYetActive {
            starts_at: code.starts_at,
        });
    }
    if now >= code.ends_at {
        return Err(DiscountRejection::Expired {
            ended_at: code.ends_at,
        });
    }
    if !code.has_remaining_redemptions() {
        return Err(DiscountRejection::LimitReached);
    }
    if subtotal < code.minimum_subtotal {
        return Err(DiscountRejection::BelowMinimumSubtotal {
            minimum: code.minimum_subtotal,
        });
    }
    if redemptions
        .iter()
        .any(|record| record.code_id == code.id && &record.user_id == user_id)
    {
        return Err(DiscountRejection::AlreadyUsed);
    }
    Ok(code)
}

/// Discount for `subtotal`, never more than the subtotal itself.
pub fn compute_discount(kind: DiscountKind, value: Decimal, subtotal: Money) -> Money {
    let computed = match kind {
        DiscountKind::Percentage => subtotal.percent(value.min(Decimal::ONE_HUNDRED)),
        DiscountKind::Fixed => Money::new(value),
    };
    computed.map_or(Money::ZERO, |amount| amount.min(subtotal))
}

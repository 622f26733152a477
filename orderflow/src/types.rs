//! Core domain types for order placement.
//!
//! All identifiers and bounded values use smart constructors so that a value,
//! once constructed, is valid everywhere it travels ("parse, don't validate").

use std::fmt::Display;

use chrono::{DateTime, NaiveDate, Utc};
use nutype::nutype;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ValidationError;

/// Identity of a persisted order.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct OrderId(Uuid);

impl OrderId {
    /// Generates a new time-ordered order identity.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identity of a discount code record (not the code string itself).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct DiscountCodeId(Uuid);

impl DiscountCodeId {
    /// Generates a new discount code identity.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identity of a redemption record.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Serialize,
    Deserialize
))]
pub struct RedemptionId(Uuid);

impl RedemptionId {
    /// Generates a new redemption identity.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// A globally unique fulfillment event identifier using UUIDv7 format.
///
/// Consumers persist the ids they have processed, so the identifier must be
/// unique per broadcast and stable across redeliveries.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` with the current timestamp.
    pub fn generate() -> Self {
        // Uuid::now_v7() always produces a version 7 identifier
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

/// Reference to the user that owns an order.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(String);

/// Reference to a catalog product.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductId(String);

/// Product display name captured on a line item at checkout time.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProductName(String);

/// Image reference captured on a line item. May be empty.
#[nutype(
    sanitize(trim),
    validate(len_char_max = 2048),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ImageRef(String);

/// Opaque shipping address string.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 500),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ShippingAddress(String);

/// Caller-generated key identifying one logical checkout attempt.
///
/// Replays carrying the same key resolve to the order the first attempt
/// produced instead of charging again.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct IdempotencyKey(String);

/// Payment collaborator's reference for an approved authorization.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TransactionRef(String);

/// Promotional code string, case-insensitive and normalized to upper-case.
#[nutype(
    sanitize(trim, uppercase),
    validate(not_empty, len_char_max = 50),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PromoCode(String);

/// Number of units of a product on a line item.
///
/// Must be positive, at most 1000 per line.
#[nutype(
    validate(greater = 0, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Into,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Quantity(u32);

/// Monetary amount.
///
/// Uses `Decimal` for exact arithmetic. Amounts are non-negative and carry at
/// most two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Maximum money amount (100 million)
    pub const MAX_AMOUNT: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 0);

    /// Zero.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Create money from decimal amount
    pub fn new(amount: Decimal) -> Result<Self, ValidationError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(ValidationError::InvalidMoney(format!(
                "amount cannot be negative: {amount}"
            )));
        }
        if amount.normalize().scale() > 2 {
            return Err(ValidationError::InvalidMoney(format!(
                "amount cannot have more than 2 decimal places: {amount}"
            )));
        }
        if amount > Self::MAX_AMOUNT {
            return Err(ValidationError::InvalidMoney(format!(
                "amount {amount} exceeds maximum {}",
                Self::MAX_AMOUNT
            )));
        }
        Ok(Self(amount.abs().round_dp(2)))
    }

    /// Create money from cents (avoids floating point issues)
    pub fn from_cents(cents: u64) -> Result<Self, ValidationError> {
        let cents = i64::try_from(cents)
            .map_err(|_| ValidationError::InvalidMoney(format!("{cents} cents is out of range")))?;
        Self::new(Decimal::new(cents, 2))
    }

    /// Get the underlying decimal value
    pub const fn amount(&self) -> Decimal {
        self.0
    }

    /// Convert to cents for storage
    pub fn to_cents(&self) -> u64 {
        (self.0 * Decimal::ONE_HUNDRED).to_u64().unwrap_or(0)
    }

    /// Add money amounts
    pub fn checked_add(self, other: Self) -> Result<Self, ValidationError> {
        Self::new(self.0 + other.0)
    }

    /// Subtract money amounts
    pub fn checked_sub(self, other: Self) -> Result<Self, ValidationError> {
        if other.0 > self.0 {
            return Err(ValidationError::InvalidMoney(format!(
                "cannot subtract {other} from {self}"
            )));
        }
        Self::new(self.0 - other.0)
    }

    /// Multiply by quantity
    pub fn times(self, quantity: Quantity) -> Result<Self, ValidationError> {
        Self::new(self.0 * Decimal::from(quantity.into_inner()))
    }

    /// Percentage of this amount, rounded to cents with midpoints away from zero.
    pub fn percent(self, percent: Decimal) -> Result<Self, ValidationError> {
        let raw = self.0 * percent / Decimal::ONE_HUNDRED;
        Self::new(raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    /// True when the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl TryFrom<Decimal> for Money {
    type Error = ValidationError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl std::iter::Sum for Money {
    // saturates at MAX_AMOUNT; only used for reporting aggregates
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        let total: Decimal = iter.map(|money| money.0).sum();
        Self(total.min(Self::MAX_AMOUNT))
    }
}

/// A timestamp for when something happened.
///
/// This wrapper ensures consistent timestamp handling throughout the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Calendar day (UTC) of this timestamp.
    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current moment.
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub Timestamp);

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn promo_code_is_normalized_to_upper_case() {
        let code = PromoCode::try_new("  welcome15 ").unwrap();
        assert_eq!(code.as_ref(), "WELCOME15");
        assert_eq!(code, PromoCode::try_new("Welcome15").unwrap());
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(UserId::try_new("   ").is_err());
        assert!(ProductId::try_new("").is_err());
        assert!(IdempotencyKey::try_new("").is_err());
        assert!(ShippingAddress::try_new(" ").is_err());
    }

    #[test]
    fn image_ref_may_be_empty() {
        assert!(ImageRef::try_new("").is_ok());
    }

    #[test]
    fn quantity_bounds() {
        assert!(Quantity::try_new(1).is_ok());
        assert!(Quantity::try_new(1000).is_ok());
        assert!(Quantity::try_new(0).is_err());
        assert!(Quantity::try_new(1001).is_err());
    }

    #[test]
    fn money_validation() {
        assert!(Money::from_cents(100).is_ok());
        assert!(Money::new(Decimal::new(1050, 2)).is_ok());
        assert!(Money::new(Decimal::new(-100, 2)).is_err());
        assert!(Money::new(Decimal::new(1001, 3)).is_err());
        // trailing zeros beyond cents are fine
        assert!(Money::new(Decimal::new(10_500, 3)).is_ok());
    }

    #[test]
    fn money_operations() {
        let one = Money::from_cents(100).unwrap();
        let two_fifty = Money::from_cents(250).unwrap();

        assert_eq!(one.checked_add(two_fifty).unwrap().to_cents(), 350);
        assert_eq!(two_fifty.checked_sub(one).unwrap().to_cents(), 150);
        assert!(one.checked_sub(two_fifty).is_err());

        let three = Quantity::try_new(3).unwrap();
        assert_eq!(one.times(three).unwrap().to_cents(), 300);
    }

    #[test]
    fn money_percent_rounds_half_away_from_zero() {
        let amount = Money::from_cents(1_005).unwrap(); // 10.05
        assert_eq!(amount.percent(Decimal::from(50)).unwrap().to_cents(), 503);
        let thousand = Money::from_cents(100_000).unwrap();
        assert_eq!(thousand.percent(Decimal::from(15)).unwrap().to_cents(), 15_000);
    }

    #[test]
    fn money_serializes_as_decimal_string() {
        let amount = Money::from_cents(15_000).unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"150.00\"");
        let parsed: Money = serde_json::from_str("\"150.00\"").unwrap();
        assert_eq!(parsed, amount);
        assert!(serde_json::from_str::<Money>("\"-1\"").is_err());
    }

    #[test]
    fn event_ids_are_unique_v7() {
        let first = EventId::generate();
        let second = EventId::generate();
        assert_ne!(first, second);
        assert!(EventId::try_new(Uuid::nil()).is_err());
    }

    proptest! {
        #[test]
        fn prop_money_from_cents_roundtrip(cents in 0u64..10_000_000_000) {
            let money = Money::from_cents(cents).unwrap();
            prop_assert_eq!(money.to_cents(), cents);
        }

        #[test]
        fn prop_percent_never_exceeds_amount(cents in 0u64..1_000_000_000, percent in 0u32..=100) {
            let money = Money::from_cents(cents).unwrap();
            let part = money.percent(Decimal::from(percent)).unwrap();
            prop_assert!(part <= money);
        }
    }
}

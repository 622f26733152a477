//! Order creation requests.
//!
//! [`OrderRequestBody`] is the raw wire shape; converting it into a
//! [`PlaceOrderRequest`] parses every field into its domain type.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::collaborators::StockLine;
use crate::errors::ValidationError;
use crate::order::{subtotal_of, LineItem};
use crate::types::{
    IdempotencyKey, ImageRef, Money, ProductId, ProductName, PromoCode, Quantity, ShippingAddress,
    Timestamp, UserId,
};

/// Card number, 12 to 19 digits. Spaces and dashes are stripped.
///
/// `Debug` and `Display` only reveal the last four digits.
#[derive(Clone, PartialEq, Eq)]
pub struct CardNumber(String);

impl CardNumber {
    /// Parses and normalizes a card number.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let digits: String = raw
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if !(12..=19).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::field("card_number", "must be 12 to 19 digits"));
        }
        Ok(Self(digits))
    }

    /// Final digit of the number.
    pub fn last_digit(&self) -> u32 {
        self.0
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .unwrap_or_default()
    }

    /// Last four digits.
    pub fn last_four(&self) -> &str {
        &self.0[self.0.len() - 4..]
    }

    /// Full digits, for handing to a payment collaborator.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CardNumber(****{})", self.last_four())
    }
}

impl fmt::Display for CardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "****{}", self.last_four())
    }
}

/// Card verification value, 3 or 4 digits. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Cvv(String);

impl Cvv {
    /// Parses a CVV.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if !(3..=4).contains(&raw.len()) || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::field("cvv", "must be 3 or 4 digits"));
        }
        Ok(Self(raw.to_string()))
    }

    /// Raw digits, for handing to a payment collaborator.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Cvv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cvv(***)")
    }
}

/// Card expiry month, written `MM/YY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardExpiry {
    month: u32,
    year: i32,
}

impl CardExpiry {
    /// Parses `MM/YY`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::field("expiry", "must be MM/YY");
        let (month, year) = raw.trim().split_once('/').ok_or_else(invalid)?;
        if month.len() != 2 || year.len() != 2 {
            return Err(invalid());
        }
        let month: u32 = month.parse().map_err(|_| invalid())?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Self {
            month,
            year: 2000 + year,
        })
    }

    /// Whether the card is unusable at `now`. Cards are valid through the
    /// end of their expiry month.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        use chrono::Datelike;
        let today = now.date();
        (today.year(), today.month()) > (self.year, self.month)
    }
}

impl fmt::Display for CardExpiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:02}", self.month, self.year % 100)
    }
}

/// Card details presented for payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentInstrument {
    /// Card number.
    pub card_number: CardNumber,
    /// Verification value.
    pub cvv: Cvv,
    /// Expiry.
    pub expiry: CardExpiry,
}

/// Client-quoted amounts. Any that are present must match the server's
/// computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotedTotals {
    /// Quoted subtotal.
    pub subtotal: Option<Money>,
    /// Quoted discount.
    pub discount_amount: Option<Money>,
    /// Quoted total.
    pub total: Option<Money>,
}

/// A parsed order creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrderRequest {
    /// Caller-generated checkout key.
    pub idempotency_key: IdempotencyKey,
    /// Owning user.
    pub user_id: UserId,
    /// Line items, in cart order.
    pub items: Vec<LineItem>,
    /// Optional discount code.
    pub discount_code: Option<PromoCode>,
    /// Amounts the client displayed.
    pub quoted: QuotedTotals,
    /// Card details.
    pub instrument: PaymentInstrument,
    /// Shipping address.
    pub shipping_address: ShippingAddress,
}

impl PlaceOrderRequest {
    /// Sum of line totals.
    pub fn subtotal(&self) -> Result<Money, ValidationError> {
        subtotal_of(&self.items)
    }

    /// Product and quantity for each line.
    pub fn stock_lines(&self) -> Vec<StockLine> {
        self.items.iter().map(StockLine::from).collect()
    }
}

/// Wire shape of a payment instrument.
#[derive(Clone, Serialize, Deserialize)]
pub struct PaymentBody {
    /// Card number.
    pub card_number: String,
    /// Verification value.
    pub cvv: String,
    /// Expiry `MM/YY`.
    pub expiry: String,
}

impl fmt::Debug for PaymentBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentBody").finish_non_exhaustive()
    }
}

/// Wire shape of a line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemBody {
    /// Product reference.
    pub product_id: String,
    /// Display name.
    pub product_name: String,
    /// Image reference.
    #[serde(default)]
    pub image_ref: String,
    /// Unit price.
    pub unit_price: Decimal,
    /// Units.
    pub quantity: u32,
}

/// Wire shape of an order creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequestBody {
    /// Caller-generated checkout key.
    pub idempotency_key: String,
    /// Owning user.
    pub user_id: String,
    /// Line items.
    pub items: Vec<LineItemBody>,
    /// Optional discount code; blank means none.
    #[serde(default)]
    pub discount_code: Option<String>,
    /// Quoted subtotal.
    #[serde(default)]
    pub subtotal: Option<Decimal>,
    /// Quoted discount.
    #[serde(default)]
    pub discount_amount: Option<Decimal>,
    /// Quoted total.
    #[serde(default)]
    pub total: Option<Decimal>,
    /// Card details.
    pub payment: PaymentBody,
    /// Shipping address.
    pub shipping_address: String,
}

impl TryFrom<LineItemBody> for LineItem {
    type Error = ValidationError;

    fn try_from(body: LineItemBody) -> Result<Self, Self::Error> {
        Ok(Self {
            product_id: ProductId::try_new(body.product_id)
                .map_err(|e| ValidationError::field("product_id", e))?,
            product_name: ProductName::try_new(body.product_name)
                .map_err(|e| ValidationError::field("product_name", e))?,
            image_ref: ImageRef::try_new(body.image_ref)
                .map_err(|e| ValidationError::field("image_ref", e))?,
            unit_price: Money::new(body.unit_price)?,
            quantity: Quantity::try_new(body.quantity)
                .map_err(|e| ValidationError::field("quantity", e))?,
        })
    }
}

impl TryFrom<OrderRequestBody> for PlaceOrderRequest {
    type Error = ValidationError;

    fn try_from(body: OrderRequestBody) -> Result<Self, Self::Error> {
        if body.items.is_empty() {
            return Err(ValidationError::EmptyOrder);
        }
        let items = body
            .items
            .into_iter()
            .map(LineItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let discount_code = body
            .discount_code
            .filter(|code| !code.trim().is_empty())
            .map(|code| {
                PromoCode::try_new(code).map_err(|e| ValidationError::field("discount_code", e))
            })
            .transpose()?;

        Ok(Self {
            idempotency_key: IdempotencyKey::try_new(body.idempotency_key)
                .map_err(|e| ValidationError::field("idempotency_key", e))?,
            user_id: UserId::try_new(body.user_id)
                .map_err(|e| ValidationError::field("user_id", e))?,
            items,
            discount_code,
            quoted: QuotedTotals {
                subtotal: body.subtotal.map(Money::new).transpose()?,
                discount_amount: body.discount_amount.map(Money::new).transpose()?,
                total: body.total.map(Money::new).transpose()?,
            },
            instrument: PaymentInstrument {
                card_number: CardNumber::parse(&body.payment.card_number)?,
                cvv: Cvv::parse(&body.payment.cvv)?,
                expiry: CardExpiry::parse(&body.payment.expiry)?,
            },
            shipping_address: ShippingAddress::try_new(body.shipping_address)
                .map_err(|e| ValidationError::field("shipping_address", e))?,
        })
    }
}

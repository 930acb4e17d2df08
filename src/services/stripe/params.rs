//! Owned request types passed across the collaborator traits. Ids stay plain strings here; the
//! live provider parses them into `stripe::*Id` values and builds the SDK's borrowed params.
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::generated::billing::subscription_item::SubscriptionProrationBehavior as SubscriptionItemProrationBehavior;
use stripe::{Currency, Metadata, PaymentIntentCaptureMethod, RefundReasonFilter, Timestamp};

pub const DEFAULT_SUBSCRIPTION_LIST_LIMIT: u64 = 10;
pub const DEFAULT_CUSTOMER_CHARGE_LIMIT: u64 = 1;

pub const INVOICE_EXPANSIONS: &[&str] = &[
    "charge",
    "payment_intent",
    "subscription",
    "subscription.default_payment_method",
];
pub const PAYMENT_INTENT_EXPANSIONS: &[&str] = &["payment_method"];
pub const CUSTOMER_SOURCES_EXPANSION: &[&str] = &["sources"];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListSubscriptions {
    pub limit: Option<u64>,
    pub customer: Option<String>,
    pub starting_after: Option<String>,
}

impl ListSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One entry of an update's `items`: no `id` adds an item, `deleted` removes one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateSubscriptionItems {
    pub id: Option<String>,
    pub price: Option<String>,
    pub quantity: Option<u64>,
    pub deleted: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateSubscription {
    pub items: Vec<UpdateSubscriptionItems>,
    pub cancel_at_period_end: Option<bool>,
    pub default_payment_method: Option<String>,
    pub description: Option<String>,
    pub trial_end: Option<Timestamp>,
    pub metadata: Option<Metadata>,
    pub proration_behavior: Option<SubscriptionProrationBehavior>,
}

impl UpdateSubscription {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CancelSubscription {
    pub invoice_now: bool,
    pub prorate: bool,
}

impl CancelSubscription {
    /// Cancel immediately without a final invoice or proration credit.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateSubscriptionItems {
    pub price: String,
    pub quantity: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateSubscription {
    pub customer: String,
    pub items: Vec<CreateSubscriptionItems>,
    pub default_payment_method: Option<String>,
    pub trial_period_days: Option<u32>,
    pub metadata: Option<Metadata>,
    pub proration_behavior: Option<SubscriptionProrationBehavior>,
}

impl CreateSubscription {
    pub fn new(customer: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateSubscriptionItem {
    pub subscription: String,
    pub price: String,
    pub quantity: Option<u64>,
    pub proration_behavior: Option<SubscriptionItemProrationBehavior>,
    pub metadata: Option<Metadata>,
}

impl CreateSubscriptionItem {
    pub fn new(subscription: impl Into<String>, price: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            price: price.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpcomingInvoice {
    pub customer: String,
    pub subscription: Option<String>,
}

impl UpcomingInvoice {
    pub fn for_subscription(customer: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            subscription: Some(subscription.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreatePaymentIntent {
    pub amount: i64,
    pub currency: Currency,
    pub customer: Option<String>,
    pub payment_method: Option<String>,
    /// e.g. `card_present` for terminal readers.
    pub payment_method_types: Vec<String>,
    pub capture_method: Option<PaymentIntentCaptureMethod>,
    pub description: Option<String>,
    pub receipt_email: Option<String>,
    pub metadata: Option<Metadata>,
}

impl CreatePaymentIntent {
    pub fn new(amount: i64, currency: Currency) -> Self {
        Self {
            amount,
            currency,
            customer: None,
            payment_method: None,
            payment_method_types: Vec::new(),
            capture_method: None,
            description: None,
            receipt_email: None,
            metadata: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdatePaymentIntent {
    pub amount: Option<i64>,
    pub currency: Option<Currency>,
    pub customer: Option<String>,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateRefund {
    pub charge: Option<String>,
    pub payment_intent: Option<String>,
    /// Partial refund amount in the smallest currency unit; the full amount when unset.
    pub amount: Option<i64>,
    pub reason: Option<RefundReasonFilter>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListCharges {
    pub customer: Option<String>,
    pub limit: Option<u64>,
}

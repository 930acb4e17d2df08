// NOTE: every provider call goes through async-stripe's typed resource API (`billing` and
// `terminal` features). The traits below keep ids as `&str` so callers and test doubles never
// build `stripe::*Id` values themselves; the live provider parses them.
use async_trait::async_trait;
use stripe::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("stripe api error: {0}")]
    Provider(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request) => classify_request_error(request),
            stripe::StripeError::JSONSerialize(e) => StripeServiceError::Serde(e.to_string()),
            stripe::StripeError::QueryStringSerialize(e) => StripeServiceError::Serde(e.to_string()),
            other => StripeServiceError::Provider(other.to_string()),
        }
    }
}

impl From<stripe::ParseIdError> for StripeServiceError {
    fn from(err: stripe::ParseIdError) -> Self {
        StripeServiceError::Validation(err.to_string())
    }
}

/// The error code wins over the HTTP status: Stripe answers most rejections with 400 and only
/// the code tells a missing resource or a state conflict apart from a bad parameter.
fn classify_request_error(request: stripe::RequestError) -> StripeServiceError {
    let status = request.http_status;
    let message = request
        .message
        .clone()
        .unwrap_or_else(|| format!("stripe request failed with status {status}"));
    match request.code {
        Some(ErrorCode::ResourceMissing) => return StripeServiceError::NotFound(message),
        Some(code) if is_state_conflict(code) => return StripeServiceError::Conflict(message),
        _ => {}
    }
    match status {
        404 => StripeServiceError::NotFound(message),
        409 => StripeServiceError::Conflict(message),
        400 if request.code.is_none() && rejects_current_state(&message) => {
            StripeServiceError::Conflict(message)
        }
        400 | 402 | 422 => StripeServiceError::Validation(message),
        _ => StripeServiceError::Provider(message),
    }
}

fn is_state_conflict(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::ChargeAlreadyCaptured
            | ErrorCode::ChargeAlreadyRefunded
            | ErrorCode::ChargeDisputed
            | ErrorCode::ChargeExpiredForCapture
            | ErrorCode::IdempotencyKeyInUse
            | ErrorCode::InvoiceNotEditable
            | ErrorCode::PaymentIntentUnexpectedState
            | ErrorCode::ResourceAlreadyExists
            | ErrorCode::TokenAlreadyUsed
            | ErrorCode::TokenInUse
    )
}

// Some transitions (paying a paid invoice, updating a canceled subscription) come back as a
// bare invalid_request_error with no code.
fn rejects_current_state(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "already",
        "canceled subscription",
        "cannot be updated",
        "unexpected state",
    ]
    .iter()
    .any(|phrase| message.contains(phrase))
}

pub type StripeResult<T> = Result<T, StripeServiceError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn list(&self, params: ListSubscriptions)
        -> StripeResult<stripe::List<stripe::Subscription>>;

    async fn retrieve(&self, subscription_id: &str) -> StripeResult<stripe::Subscription>;

    async fn update(
        &self,
        subscription_id: &str,
        params: UpdateSubscription,
    ) -> StripeResult<stripe::Subscription>;

    async fn cancel(
        &self,
        subscription_id: &str,
        params: CancelSubscription,
    ) -> StripeResult<stripe::Subscription>;

    async fn create(&self, params: CreateSubscription) -> StripeResult<stripe::Subscription>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionItemApi: Send + Sync {
    async fn create(
        &self,
        params: CreateSubscriptionItem,
    ) -> StripeResult<stripe::SubscriptionItem>;

    async fn delete(&self, item_id: &str) -> StripeResult<Deleted>;
}

#[async_trait]
pub trait InvoiceApi: Send + Sync {
    async fn retrieve(&self, invoice_id: &str, expand: &[&str]) -> StripeResult<stripe::Invoice>;

    async fn pay(&self, invoice_id: &str) -> StripeResult<stripe::Invoice>;

    /// Preview of the next invoice for a customer (and optionally one of its subscriptions).
    async fn upcoming(&self, params: UpcomingInvoice) -> StripeResult<stripe::Invoice>;
}

#[async_trait]
pub trait InvoiceItemApi: Send + Sync {
    async fn delete(&self, invoice_item_id: &str) -> StripeResult<Deleted>;
}

#[async_trait]
pub trait PaymentIntentApi: Send + Sync {
    async fn retrieve(
        &self,
        payment_intent_id: &str,
        expand: &[&str],
    ) -> StripeResult<stripe::PaymentIntent>;

    async fn create(&self, params: CreatePaymentIntent) -> StripeResult<stripe::PaymentIntent>;

    async fn update(
        &self,
        payment_intent_id: &str,
        params: UpdatePaymentIntent,
    ) -> StripeResult<stripe::PaymentIntent>;

    async fn confirm(&self, payment_intent_id: &str) -> StripeResult<stripe::PaymentIntent>;
}

#[async_trait]
pub trait RefundApi: Send + Sync {
    async fn create(&self, params: CreateRefund) -> StripeResult<stripe::Refund>;
}

#[async_trait]
pub trait PaymentMethodApi: Send + Sync {
    async fn retrieve(&self, payment_method_id: &str) -> StripeResult<stripe::PaymentMethod>;
}

#[async_trait]
pub trait ChargeApi: Send + Sync {
    async fn retrieve(&self, charge_id: &str) -> StripeResult<stripe::Charge>;

    async fn list(&self, params: ListCharges) -> StripeResult<stripe::List<stripe::Charge>>;
}

#[async_trait]
pub trait TerminalApi: Send + Sync {
    async fn create_connection_token(&self) -> StripeResult<stripe::TerminalConnectionToken>;
}

#[async_trait]
pub trait CustomerApi: Send + Sync {
    async fn retrieve(&self, customer_id: &str, expand: &[&str])
        -> StripeResult<stripe::Customer>;
}

mod facade;
mod live;
mod mock;
pub mod models;
pub mod params;
mod reconcile;

pub use facade::{StripeCollaborators, StripeService};
pub use live::LiveStripeService;
pub use mock::MockStripeService;
pub use models::Deleted;
pub use params::*;
pub use reconcile::SubscriptionReconciler;

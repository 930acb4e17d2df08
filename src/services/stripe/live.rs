use std::str::FromStr;

use super::{
    CancelSubscription, ChargeApi, CreatePaymentIntent, CreateRefund, CreateSubscription,
    CreateSubscriptionItem, CustomerApi, Deleted, InvoiceApi, InvoiceItemApi, ListCharges,
    ListSubscriptions, PaymentIntentApi, PaymentMethodApi, RefundApi, StripeResult,
    StripeServiceError, SubscriptionApi, SubscriptionItemApi, TerminalApi, UpcomingInvoice,
    UpdatePaymentIntent, UpdateSubscription, UpdateSubscriptionItems,
};
use async_trait::async_trait;

/// Talks to the Stripe REST API with the account's secret key.
#[derive(Clone)]
pub struct LiveStripeService {
    client: stripe::Client,
}

impl LiveStripeService {
    pub fn new(secret_key: impl Into<String>) -> Self {
        let client = stripe::Client::new(secret_key);
        Self { client }
    }

    /// Points the client at another API host (stripe-mock, a recording proxy, tests).
    pub fn with_api_base(api_base: &str, secret_key: impl Into<String>) -> Self {
        let client = stripe::Client::from_url(api_base, secret_key);
        Self { client }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        match settings.api_base.as_deref() {
            Some(api_base) => Self::with_api_base(api_base, settings.secret_key.clone()),
            None => Self::new(settings.secret_key.clone()),
        }
    }
}

// The SDK only checks the prefix, and ids are formatted into the request path.
fn parse_id<T>(raw: &str) -> StripeResult<T>
where
    T: FromStr<Err = stripe::ParseIdError>,
{
    let plain_token = !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !plain_token {
        return Err(StripeServiceError::Validation(format!(
            "invalid identifier: {raw:?}"
        )));
    }
    Ok(raw.parse::<T>()?)
}

fn map_update_items(items: &[UpdateSubscriptionItems]) -> Vec<stripe::UpdateSubscriptionItems> {
    items
        .iter()
        .map(|item| stripe::UpdateSubscriptionItems {
            id: item.id.clone(),
            price: item.price.clone(),
            quantity: item.quantity,
            deleted: item.deleted,
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl SubscriptionApi for LiveStripeService {
    async fn list(
        &self,
        params: ListSubscriptions,
    ) -> StripeResult<stripe::List<stripe::Subscription>> {
        let mut list_params = stripe::ListSubscriptions::new();
        list_params.limit = params.limit;
        list_params.customer = params
            .customer
            .as_deref()
            .map(parse_id::<stripe::CustomerId>)
            .transpose()?;
        list_params.starting_after = params
            .starting_after
            .as_deref()
            .map(parse_id::<stripe::SubscriptionId>)
            .transpose()?;

        let subs = stripe::Subscription::list(&self.client, &list_params).await?;
        Ok(subs)
    }

    async fn retrieve(&self, subscription_id: &str) -> StripeResult<stripe::Subscription> {
        let sub_id = parse_id::<stripe::SubscriptionId>(subscription_id)?;
        let sub = stripe::Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(sub)
    }

    async fn update(
        &self,
        subscription_id: &str,
        params: UpdateSubscription,
    ) -> StripeResult<stripe::Subscription> {
        let sub_id = parse_id::<stripe::SubscriptionId>(subscription_id)?;
        let mut update = stripe::UpdateSubscription::new();
        if !params.items.is_empty() {
            update.items = Some(map_update_items(&params.items));
        }
        update.cancel_at_period_end = params.cancel_at_period_end;
        update.default_payment_method = params.default_payment_method.as_deref();
        update.description = params.description.clone();
        update.trial_end = params.trial_end.map(stripe::Scheduled::at);
        update.metadata = params.metadata.clone();
        update.proration_behavior = params.proration_behavior;

        let sub = stripe::Subscription::update(&self.client, &sub_id, update).await?;
        Ok(sub)
    }

    async fn cancel(
        &self,
        subscription_id: &str,
        params: CancelSubscription,
    ) -> StripeResult<stripe::Subscription> {
        let sub_id = parse_id::<stripe::SubscriptionId>(subscription_id)?;
        let cancel = stripe::CancelSubscription {
            invoice_now: Some(params.invoice_now),
            prorate: Some(params.prorate),
            ..Default::default()
        };
        let sub = stripe::Subscription::cancel(&self.client, &sub_id, cancel).await?;
        Ok(sub)
    }

    async fn create(&self, params: CreateSubscription) -> StripeResult<stripe::Subscription> {
        let customer = parse_id::<stripe::CustomerId>(&params.customer)?;
        let mut create = stripe::CreateSubscription::new(customer);
        if !params.items.is_empty() {
            create.items = Some(
                params
                    .items
                    .iter()
                    .map(|item| stripe::CreateSubscriptionItems {
                        price: Some(item.price.clone()),
                        quantity: item.quantity,
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        create.default_payment_method = params.default_payment_method.as_deref();
        create.trial_period_days = params.trial_period_days;
        create.metadata = params.metadata.clone();
        create.proration_behavior = params.proration_behavior;

        let sub = stripe::Subscription::create(&self.client, create).await?;
        Ok(sub)
    }
}

#[async_trait]
impl SubscriptionItemApi for LiveStripeService {
    async fn create(
        &self,
        params: CreateSubscriptionItem,
    ) -> StripeResult<stripe::SubscriptionItem> {
        let sub_id = parse_id::<stripe::SubscriptionId>(&params.subscription)?;
        let mut create = stripe::CreateSubscriptionItem::new(sub_id);
        create.price = Some(params.price.parse::<stripe::PriceId>()?);
        create.quantity = params.quantity;
        create.proration_behavior = params.proration_behavior;
        create.metadata = params.metadata.clone();

        let item = stripe::SubscriptionItem::create(&self.client, create).await?;
        Ok(item)
    }

    async fn delete(&self, item_id: &str) -> StripeResult<Deleted> {
        let item_id = parse_id::<stripe::SubscriptionItemId>(item_id)?;
        let deleted = stripe::SubscriptionItem::delete(&self.client, &item_id).await?;
        Ok(Deleted::of(deleted.id, deleted.deleted))
    }
}

#[async_trait]
impl InvoiceApi for LiveStripeService {
    async fn retrieve(&self, invoice_id: &str, expand: &[&str]) -> StripeResult<stripe::Invoice> {
        let invoice_id = parse_id::<stripe::InvoiceId>(invoice_id)?;
        let invoice = stripe::Invoice::retrieve(&self.client, &invoice_id, expand).await?;
        Ok(invoice)
    }

    async fn pay(&self, invoice_id: &str) -> StripeResult<stripe::Invoice> {
        let invoice_id = parse_id::<stripe::InvoiceId>(invoice_id)?;
        let invoice = stripe::Invoice::pay(&self.client, &invoice_id).await?;
        Ok(invoice)
    }

    async fn upcoming(&self, params: UpcomingInvoice) -> StripeResult<stripe::Invoice> {
        let customer = parse_id::<stripe::CustomerId>(&params.customer)?;
        let mut upcoming = stripe::RetrieveUpcomingInvoice::new(customer);
        upcoming.subscription = params
            .subscription
            .as_deref()
            .map(parse_id::<stripe::SubscriptionId>)
            .transpose()?;

        let invoice = stripe::Invoice::upcoming(&self.client, upcoming).await?;
        Ok(invoice)
    }
}

#[async_trait]
impl InvoiceItemApi for LiveStripeService {
    async fn delete(&self, invoice_item_id: &str) -> StripeResult<Deleted> {
        let invoice_item_id = parse_id::<stripe::InvoiceItemId>(invoice_item_id)?;
        let deleted = stripe::InvoiceItem::delete(&self.client, &invoice_item_id).await?;
        Ok(Deleted::of(deleted.id, deleted.deleted))
    }
}

#[async_trait]
impl PaymentIntentApi for LiveStripeService {
    async fn retrieve(
        &self,
        payment_intent_id: &str,
        expand: &[&str],
    ) -> StripeResult<stripe::PaymentIntent> {
        let intent_id = parse_id::<stripe::PaymentIntentId>(payment_intent_id)?;
        let intent = stripe::PaymentIntent::retrieve(&self.client, &intent_id, expand).await?;
        Ok(intent)
    }

    async fn create(&self, params: CreatePaymentIntent) -> StripeResult<stripe::PaymentIntent> {
        let mut create = stripe::CreatePaymentIntent::new(params.amount, params.currency);
        create.customer = params
            .customer
            .as_deref()
            .map(parse_id::<stripe::CustomerId>)
            .transpose()?;
        create.payment_method = params
            .payment_method
            .as_deref()
            .map(parse_id::<stripe::PaymentMethodId>)
            .transpose()?;
        if !params.payment_method_types.is_empty() {
            create.payment_method_types = Some(params.payment_method_types.clone());
        }
        create.capture_method = params.capture_method;
        create.description = params.description.as_deref();
        create.receipt_email = params.receipt_email.as_deref();
        create.metadata = params.metadata.clone();

        let intent = stripe::PaymentIntent::create(&self.client, create).await?;
        Ok(intent)
    }

    async fn update(
        &self,
        payment_intent_id: &str,
        params: UpdatePaymentIntent,
    ) -> StripeResult<stripe::PaymentIntent> {
        let intent_id = parse_id::<stripe::PaymentIntentId>(payment_intent_id)?;
        let mut update = stripe::UpdatePaymentIntent::new();
        update.amount = params.amount;
        update.currency = params.currency;
        update.customer = params
            .customer
            .as_deref()
            .map(parse_id::<stripe::CustomerId>)
            .transpose()?;
        update.payment_method = params
            .payment_method
            .as_deref()
            .map(parse_id::<stripe::PaymentMethodId>)
            .transpose()?;
        update.description = params.description.as_deref();
        update.metadata = params.metadata.clone();

        let intent = stripe::PaymentIntent::update(&self.client, &intent_id, update).await?;
        Ok(intent)
    }

    async fn confirm(&self, payment_intent_id: &str) -> StripeResult<stripe::PaymentIntent> {
        let intent_id = parse_id::<stripe::PaymentIntentId>(payment_intent_id)?;
        let intent = stripe::PaymentIntent::confirm(
            &self.client,
            intent_id.as_str(),
            stripe::PaymentIntentConfirmParams::default(),
        )
        .await?;
        Ok(intent)
    }
}

#[async_trait]
impl RefundApi for LiveStripeService {
    async fn create(&self, params: CreateRefund) -> StripeResult<stripe::Refund> {
        let mut create = stripe::CreateRefund::new();
        create.charge = params
            .charge
            .as_deref()
            .map(parse_id::<stripe::ChargeId>)
            .transpose()?;
        create.payment_intent = params
            .payment_intent
            .as_deref()
            .map(parse_id::<stripe::PaymentIntentId>)
            .transpose()?;
        create.amount = params.amount;
        create.reason = params.reason;
        create.metadata = params.metadata.clone();

        let refund = stripe::Refund::create(&self.client, create).await?;
        Ok(refund)
    }
}

#[async_trait]
impl PaymentMethodApi for LiveStripeService {
    async fn retrieve(&self, payment_method_id: &str) -> StripeResult<stripe::PaymentMethod> {
        let method_id = parse_id::<stripe::PaymentMethodId>(payment_method_id)?;
        let method = stripe::PaymentMethod::retrieve(&self.client, &method_id, &[]).await?;
        Ok(method)
    }
}

#[async_trait]
impl ChargeApi for LiveStripeService {
    async fn retrieve(&self, charge_id: &str) -> StripeResult<stripe::Charge> {
        let charge_id = parse_id::<stripe::ChargeId>(charge_id)?;
        let charge = stripe::Charge::retrieve(&self.client, &charge_id, &[]).await?;
        Ok(charge)
    }

    async fn list(&self, params: ListCharges) -> StripeResult<stripe::List<stripe::Charge>> {
        let mut list_params = stripe::ListCharges::new();
        list_params.customer = params
            .customer
            .as_deref()
            .map(parse_id::<stripe::CustomerId>)
            .transpose()?;
        list_params.limit = params.limit;

        let charges = stripe::Charge::list(&self.client, &list_params).await?;
        Ok(charges)
    }
}

#[async_trait]
impl TerminalApi for LiveStripeService {
    async fn create_connection_token(&self) -> StripeResult<stripe::TerminalConnectionToken> {
        let token = stripe::TerminalConnectionToken::create(
            &self.client,
            stripe::CreateTerminalConnectionToken::new(),
        )
        .await?;
        Ok(token)
    }
}

#[async_trait]
impl CustomerApi for LiveStripeService {
    async fn retrieve(
        &self,
        customer_id: &str,
        expand: &[&str],
    ) -> StripeResult<stripe::Customer> {
        let customer_id = parse_id::<stripe::CustomerId>(customer_id)?;
        let customer = stripe::Customer::retrieve(&self.client, &customer_id, expand).await?;
        Ok(customer)
    }
}

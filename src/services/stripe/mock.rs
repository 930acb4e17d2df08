use super::{
    CancelSubscription, ChargeApi, CreatePaymentIntent, CreateRefund, CreateSubscription,
    CreateSubscriptionItem, CustomerApi, Deleted, InvoiceApi, InvoiceItemApi, ListCharges,
    ListSubscriptions, PaymentIntentApi, PaymentMethodApi, RefundApi, StripeResult,
    StripeServiceError, SubscriptionApi, SubscriptionItemApi, TerminalApi, UpcomingInvoice,
    UpdatePaymentIntent, UpdateSubscription,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use stripe::{
    Charge, Customer, Expandable, Invoice, InvoiceStatus, List, PaymentIntent,
    PaymentIntentStatus, PaymentMethod, Price, Refund, RefundReason, RefundReasonFilter,
    Subscription, SubscriptionItem, SubscriptionStatus, TerminalConnectionToken,
};

/// In-memory stand-in for Stripe. State is shared between clones so a test can keep a handle
/// while the service under test owns another.
#[derive(Clone, Default)]
pub struct MockStripeService {
    pub subscriptions: Arc<Mutex<BTreeMap<String, Subscription>>>,
    /// Upcoming invoice previews keyed by subscription id.
    pub upcoming_invoices: Arc<Mutex<BTreeMap<String, Invoice>>>,
    pub invoices: Arc<Mutex<BTreeMap<String, Invoice>>>,
    pub payment_intents: Arc<Mutex<BTreeMap<String, PaymentIntent>>>,
    pub payment_methods: Arc<Mutex<BTreeMap<String, PaymentMethod>>>,
    pub charges: Arc<Mutex<Vec<Charge>>>,
    pub customers: Arc<Mutex<BTreeMap<String, Customer>>>,

    pub subscription_updates: Arc<Mutex<Vec<(String, UpdateSubscription)>>>,
    pub cancellations: Arc<Mutex<Vec<(String, CancelSubscription)>>>,
    pub deleted_subscription_items: Arc<Mutex<Vec<String>>>,
    pub deleted_invoice_items: Arc<Mutex<Vec<String>>>,
    pub refunds: Arc<Mutex<Vec<Refund>>>,
    /// Ids whose deletion should fail with a provider error.
    pub failing_deletes: Arc<Mutex<HashSet<String>>>,

    sequence: Arc<AtomicU64>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, subscription: Subscription) -> Self {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id.to_string(), subscription);
        self
    }

    pub fn with_upcoming_invoice(self, subscription_id: &str, invoice: Invoice) -> Self {
        self.upcoming_invoices
            .lock()
            .unwrap()
            .insert(subscription_id.to_string(), invoice);
        self
    }

    pub fn with_invoice(self, invoice: Invoice) -> Self {
        let id = if invoice.id.is_none() {
            self.make_id("in_test")
        } else {
            invoice.id.to_string()
        };
        self.invoices.lock().unwrap().insert(id, invoice);
        self
    }

    pub fn with_payment_method(self, method: PaymentMethod) -> Self {
        self.payment_methods
            .lock()
            .unwrap()
            .insert(method.id.to_string(), method);
        self
    }

    pub fn with_charge(self, charge: Charge) -> Self {
        self.charges.lock().unwrap().push(charge);
        self
    }

    pub fn with_customer(self, customer: Customer) -> Self {
        self.customers
            .lock()
            .unwrap()
            .insert(customer.id.to_string(), customer);
        self
    }

    pub fn fail_delete_of(self, id: &str) -> Self {
        self.failing_deletes.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
    }

    pub fn upcoming_invoice(&self, subscription_id: &str) -> Option<Invoice> {
        self.upcoming_invoices
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
    }

    fn make_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_{}", prefix, n)
    }

    fn next_id<T>(&self, prefix: &str) -> StripeResult<T>
    where
        T: FromStr<Err = stripe::ParseIdError>,
    {
        Ok(self.make_id(prefix).parse::<T>()?)
    }

    fn check_delete(&self, id: &str) -> StripeResult<()> {
        if self.failing_deletes.lock().unwrap().contains(id) {
            return Err(StripeServiceError::Provider(format!(
                "simulated failure deleting {}",
                id
            )));
        }
        Ok(())
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn not_found(kind: &str, id: &str) -> StripeServiceError {
    StripeServiceError::NotFound(format!("No such {}: '{}'", kind, id))
}

fn page<T>(data: Vec<T>, has_more: bool, url: &str) -> List<T> {
    List {
        data,
        has_more,
        url: url.to_string(),
        ..Default::default()
    }
}

fn price(id: &str) -> StripeResult<Price> {
    Ok(Price {
        id: id.parse()?,
        ..Default::default()
    })
}

fn expand_id<T>(raw: &str) -> StripeResult<Expandable<T>>
where
    T: stripe::Object,
    T::Id: FromStr<Err = stripe::ParseIdError>,
{
    Ok(Expandable::Id(raw.parse()?))
}

// New items sort after the existing ones by creation time.
fn next_created(items: &[SubscriptionItem]) -> i64 {
    items
        .iter()
        .filter_map(|item| item.created)
        .max()
        .map_or_else(now, |latest| latest + 1)
}

#[async_trait]
impl SubscriptionApi for MockStripeService {
    async fn list(&self, params: ListSubscriptions) -> StripeResult<List<Subscription>> {
        let guard = self.subscriptions.lock().unwrap();
        let mut matching = guard
            .values()
            .filter(|sub| {
                params
                    .customer
                    .as_deref()
                    .map_or(true, |customer| sub.customer.id() == customer)
            })
            .skip_while(|sub| {
                params
                    .starting_after
                    .as_deref()
                    .map_or(false, |after| sub.id.as_str() <= after)
            })
            .cloned()
            .collect::<Vec<_>>();
        let limit = params.limit.unwrap_or(10) as usize;
        let has_more = matching.len() > limit;
        matching.truncate(limit);
        Ok(page(matching, has_more, "/v1/subscriptions"))
    }

    async fn retrieve(&self, subscription_id: &str) -> StripeResult<Subscription> {
        self.subscription(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))
    }

    async fn update(
        &self,
        subscription_id: &str,
        params: UpdateSubscription,
    ) -> StripeResult<Subscription> {
        // capture the request
        self.subscription_updates
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), params.clone()));

        let mut guard = self.subscriptions.lock().unwrap();
        let sub = guard
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))?;
        if sub.status == SubscriptionStatus::Canceled {
            return Err(StripeServiceError::Conflict(format!(
                "subscription {} is canceled and cannot be updated",
                subscription_id
            )));
        }

        for change in params.items {
            match change.id {
                Some(id) => {
                    let pos = sub
                        .items
                        .data
                        .iter()
                        .position(|item| item.id == id)
                        .ok_or_else(|| not_found("subscription item", &id))?;
                    if change.deleted == Some(true) {
                        sub.items.data.remove(pos);
                        continue;
                    }
                    let item = &mut sub.items.data[pos];
                    if let Some(price_id) = change.price {
                        item.price = Some(price(&price_id)?);
                    }
                    if change.quantity.is_some() {
                        item.quantity = change.quantity;
                    }
                }
                None => {
                    let item = SubscriptionItem {
                        id: self.next_id("si_test")?,
                        created: Some(next_created(&sub.items.data)),
                        subscription: Some(subscription_id.to_string()),
                        price: change.price.as_deref().map(price).transpose()?,
                        quantity: change.quantity.or(Some(1)),
                        ..Default::default()
                    };
                    sub.items.data.push(item);
                }
            }
        }
        if let Some(flag) = params.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
            sub.cancel_at = if flag {
                Some(sub.current_period_end)
            } else {
                None
            };
        }
        if let Some(method) = params.default_payment_method {
            sub.default_payment_method = Some(expand_id(&method)?);
        }
        if let Some(metadata) = params.metadata {
            sub.metadata.extend(metadata);
        }
        Ok(sub.clone())
    }

    async fn cancel(
        &self,
        subscription_id: &str,
        params: CancelSubscription,
    ) -> StripeResult<Subscription> {
        self.cancellations
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), params));

        let mut guard = self.subscriptions.lock().unwrap();
        let sub = guard
            .get_mut(subscription_id)
            .ok_or_else(|| not_found("subscription", subscription_id))?;
        if sub.status == SubscriptionStatus::Canceled {
            return Err(StripeServiceError::Conflict(format!(
                "subscription {} is already canceled",
                subscription_id
            )));
        }
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(now());
        Ok(sub.clone())
    }

    async fn create(&self, params: CreateSubscription) -> StripeResult<Subscription> {
        if params.items.is_empty() {
            return Err(StripeServiceError::Validation(
                "Missing required param: items.".into(),
            ));
        }
        let id: stripe::SubscriptionId = self.next_id("sub_test")?;
        let created = now();
        let items = params
            .items
            .iter()
            .map(|item| {
                Ok(SubscriptionItem {
                    id: self.next_id("si_test")?,
                    created: Some(created),
                    subscription: Some(id.to_string()),
                    price: Some(price(&item.price)?),
                    quantity: item.quantity.or(Some(1)),
                    ..Default::default()
                })
            })
            .collect::<StripeResult<Vec<_>>>()?;
        let status = if params.trial_period_days.is_some() {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        let sub = Subscription {
            id: id.clone(),
            customer: expand_id(&params.customer)?,
            status,
            items: page(items, false, "/v1/subscription_items"),
            created,
            start_date: created,
            default_payment_method: params
                .default_payment_method
                .as_deref()
                .map(expand_id)
                .transpose()?,
            metadata: params.metadata.unwrap_or_default(),
            ..Default::default()
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.to_string(), sub.clone());
        Ok(sub)
    }
}

#[async_trait]
impl SubscriptionItemApi for MockStripeService {
    async fn create(&self, params: CreateSubscriptionItem) -> StripeResult<SubscriptionItem> {
        let mut guard = self.subscriptions.lock().unwrap();
        let sub = guard
            .get_mut(&params.subscription)
            .ok_or_else(|| not_found("subscription", &params.subscription))?;
        let item = SubscriptionItem {
            id: self.next_id("si_test")?,
            created: Some(next_created(&sub.items.data)),
            subscription: Some(params.subscription.clone()),
            price: Some(price(&params.price)?),
            quantity: params.quantity.or(Some(1)),
            metadata: params.metadata,
            ..Default::default()
        };
        sub.items.data.push(item.clone());
        Ok(item)
    }

    async fn delete(&self, item_id: &str) -> StripeResult<Deleted> {
        self.check_delete(item_id)?;
        let mut guard = self.subscriptions.lock().unwrap();
        let removed = guard.values_mut().any(|sub| {
            let before = sub.items.data.len();
            sub.items.data.retain(|item| item.id != item_id);
            sub.items.data.len() != before
        });
        if !removed {
            return Err(not_found("subscription item", item_id));
        }
        self.deleted_subscription_items
            .lock()
            .unwrap()
            .push(item_id.to_string());
        Ok(Deleted::of(item_id, true))
    }
}

#[async_trait]
impl InvoiceApi for MockStripeService {
    async fn retrieve(&self, invoice_id: &str, _expand: &[&str]) -> StripeResult<Invoice> {
        self.invoices
            .lock()
            .unwrap()
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| not_found("invoice", invoice_id))
    }

    async fn pay(&self, invoice_id: &str) -> StripeResult<Invoice> {
        let mut guard = self.invoices.lock().unwrap();
        let invoice = guard
            .get_mut(invoice_id)
            .ok_or_else(|| not_found("invoice", invoice_id))?;
        if invoice.paid == Some(true) {
            return Err(StripeServiceError::Conflict("Invoice is already paid".into()));
        }
        invoice.paid = Some(true);
        invoice.status = Some(InvoiceStatus::Paid);
        invoice.amount_paid = invoice.amount_due;
        invoice.amount_remaining = Some(0);
        Ok(invoice.clone())
    }

    async fn upcoming(&self, params: UpcomingInvoice) -> StripeResult<Invoice> {
        let key = params.subscription.as_deref().unwrap_or(&params.customer);
        self.upcoming_invoice(key).ok_or_else(|| {
            StripeServiceError::NotFound(format!(
                "No upcoming invoices for customer: {}",
                params.customer
            ))
        })
    }
}

#[async_trait]
impl InvoiceItemApi for MockStripeService {
    async fn delete(&self, invoice_item_id: &str) -> StripeResult<Deleted> {
        self.check_delete(invoice_item_id)?;
        let mut guard = self.upcoming_invoices.lock().unwrap();
        let removed = guard.values_mut().any(|invoice| {
            let Some(lines) = invoice.lines.as_mut() else {
                return false;
            };
            let before = lines.data.len();
            lines.data.retain(|line| {
                let item_id = line.invoice_item.as_ref().map(|item| item.id());
                match item_id {
                    Some(item_id) => item_id != invoice_item_id,
                    None => line.id != invoice_item_id,
                }
            });
            lines.data.len() != before
        });
        if !removed {
            return Err(not_found("invoiceitem", invoice_item_id));
        }
        self.deleted_invoice_items
            .lock()
            .unwrap()
            .push(invoice_item_id.to_string());
        Ok(Deleted::of(invoice_item_id, true))
    }
}

#[async_trait]
impl PaymentIntentApi for MockStripeService {
    async fn retrieve(
        &self,
        payment_intent_id: &str,
        expand: &[&str],
    ) -> StripeResult<PaymentIntent> {
        let mut intent = self
            .payment_intents
            .lock()
            .unwrap()
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| not_found("payment_intent", payment_intent_id))?;
        if expand.contains(&"payment_method") {
            if let Some(Expandable::Id(pm_id)) = intent.payment_method.clone() {
                if let Some(method) = self.payment_methods.lock().unwrap().get(pm_id.as_str()) {
                    intent.payment_method = Some(Expandable::Object(Box::new(method.clone())));
                }
            }
        }
        Ok(intent)
    }

    async fn create(&self, params: CreatePaymentIntent) -> StripeResult<PaymentIntent> {
        if params.amount <= 0 {
            return Err(StripeServiceError::Validation(
                "Amount must be greater than zero".into(),
            ));
        }
        let id: stripe::PaymentIntentId = self.next_id("pi_test")?;
        let status = if params.payment_method.is_some() {
            PaymentIntentStatus::RequiresConfirmation
        } else {
            PaymentIntentStatus::RequiresPaymentMethod
        };
        let intent = PaymentIntent {
            id: id.clone(),
            amount: params.amount,
            currency: params.currency,
            status,
            capture_method: params.capture_method.unwrap_or_default(),
            customer: params
                .customer
                .as_deref()
                .map(expand_id)
                .transpose()?,
            payment_method: params
                .payment_method
                .as_deref()
                .map(expand_id)
                .transpose()?,
            payment_method_types: params.payment_method_types,
            client_secret: Some(format!("{}_secret_test", id)),
            description: params.description,
            metadata: params.metadata.unwrap_or_default(),
            ..Default::default()
        };
        self.payment_intents
            .lock()
            .unwrap()
            .insert(id.to_string(), intent.clone());
        Ok(intent)
    }

    async fn update(
        &self,
        payment_intent_id: &str,
        params: UpdatePaymentIntent,
    ) -> StripeResult<PaymentIntent> {
        let mut guard = self.payment_intents.lock().unwrap();
        let intent = guard
            .get_mut(payment_intent_id)
            .ok_or_else(|| not_found("payment_intent", payment_intent_id))?;
        if matches!(
            intent.status,
            PaymentIntentStatus::Succeeded | PaymentIntentStatus::Canceled
        ) {
            return Err(StripeServiceError::Conflict(format!(
                "This PaymentIntent's status is {} and it cannot be updated",
                intent.status
            )));
        }
        if let Some(amount) = params.amount {
            intent.amount = amount;
        }
        if let Some(currency) = params.currency {
            intent.currency = currency;
        }
        if let Some(customer) = params.customer {
            intent.customer = Some(expand_id(&customer)?);
        }
        if let Some(method) = params.payment_method {
            intent.payment_method = Some(expand_id(&method)?);
            intent.status = PaymentIntentStatus::RequiresConfirmation;
        }
        if params.description.is_some() {
            intent.description = params.description;
        }
        if let Some(metadata) = params.metadata {
            intent.metadata.extend(metadata);
        }
        Ok(intent.clone())
    }

    async fn confirm(&self, payment_intent_id: &str) -> StripeResult<PaymentIntent> {
        let mut guard = self.payment_intents.lock().unwrap();
        let intent = guard
            .get_mut(payment_intent_id)
            .ok_or_else(|| not_found("payment_intent", payment_intent_id))?;
        if intent.payment_method.is_none() {
            return Err(StripeServiceError::Validation(
                "You cannot confirm this PaymentIntent because it's missing a payment method."
                    .into(),
            ));
        }
        if intent.status == PaymentIntentStatus::Succeeded {
            return Err(StripeServiceError::Conflict(
                "This PaymentIntent has already succeeded.".into(),
            ));
        }
        intent.status = PaymentIntentStatus::Succeeded;
        intent.amount_received = intent.amount;
        Ok(intent.clone())
    }
}

fn refund_reason(reason: RefundReasonFilter) -> RefundReason {
    match reason {
        RefundReasonFilter::Duplicate => RefundReason::Duplicate,
        RefundReasonFilter::Fraudulent => RefundReason::Fraudulent,
        RefundReasonFilter::RequestedByCustomer => RefundReason::RequestedByCustomer,
    }
}

#[async_trait]
impl RefundApi for MockStripeService {
    async fn create(&self, params: CreateRefund) -> StripeResult<Refund> {
        let amount = match (&params.charge, &params.payment_intent) {
            (Some(charge_id), _) => self
                .charges
                .lock()
                .unwrap()
                .iter()
                .find(|charge| charge.id == *charge_id)
                .map(|charge| charge.amount - charge.amount_refunded),
            (None, Some(intent_id)) => self
                .payment_intents
                .lock()
                .unwrap()
                .get(intent_id)
                .map(|intent| intent.amount_received),
            (None, None) => {
                return Err(StripeServiceError::Validation(
                    "One of `charge` or `payment_intent` is required.".into(),
                ))
            }
        };
        let refund = Refund {
            id: self.next_id("re_test")?,
            amount: params.amount.or(amount).unwrap_or_default(),
            created: now(),
            status: Some("succeeded".into()),
            reason: params.reason.map(refund_reason),
            charge: params
                .charge
                .as_deref()
                .map(expand_id)
                .transpose()?,
            payment_intent: params
                .payment_intent
                .as_deref()
                .map(expand_id)
                .transpose()?,
            metadata: params.metadata,
            ..Default::default()
        };
        self.refunds.lock().unwrap().push(refund.clone());
        Ok(refund)
    }
}

#[async_trait]
impl PaymentMethodApi for MockStripeService {
    async fn retrieve(&self, payment_method_id: &str) -> StripeResult<PaymentMethod> {
        self.payment_methods
            .lock()
            .unwrap()
            .get(payment_method_id)
            .cloned()
            .ok_or_else(|| not_found("payment_method", payment_method_id))
    }
}

#[async_trait]
impl ChargeApi for MockStripeService {
    async fn retrieve(&self, charge_id: &str) -> StripeResult<Charge> {
        self.charges
            .lock()
            .unwrap()
            .iter()
            .find(|charge| charge.id == charge_id)
            .cloned()
            .ok_or_else(|| not_found("charge", charge_id))
    }

    async fn list(&self, params: ListCharges) -> StripeResult<List<Charge>> {
        let guard = self.charges.lock().unwrap();
        // Stripe lists newest first
        let mut matching: Vec<Charge> = guard
            .iter()
            .rev()
            .filter(|charge| match params.customer.as_deref() {
                Some(customer) => charge
                    .customer
                    .as_ref()
                    .map_or(false, |c| c.id() == customer),
                None => true,
            })
            .cloned()
            .collect();
        let limit = params.limit.unwrap_or(10) as usize;
        let has_more = matching.len() > limit;
        matching.truncate(limit);
        Ok(page(matching, has_more, "/v1/charges"))
    }
}

#[async_trait]
impl TerminalApi for MockStripeService {
    async fn create_connection_token(&self) -> StripeResult<TerminalConnectionToken> {
        Ok(TerminalConnectionToken {
            secret: self.make_id("pst_test"),
            location: None,
        })
    }
}

#[async_trait]
impl CustomerApi for MockStripeService {
    async fn retrieve(&self, customer_id: &str, expand: &[&str]) -> StripeResult<Customer> {
        let mut customer = self
            .customers
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .ok_or_else(|| not_found("customer", customer_id))?;
        if !expand.contains(&"sources") {
            customer.sources = List::default();
        }
        Ok(customer)
    }
}

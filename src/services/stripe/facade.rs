use std::sync::Arc;

use tracing::info;

use stripe::{
    CardDetails, Charge, Customer, Invoice, List, PaymentIntent, PaymentMethod, Refund,
    Subscription, SubscriptionItem, TerminalConnectionToken,
};

use super::{
    CancelSubscription, ChargeApi, CreatePaymentIntent, CreateRefund, CreateSubscription,
    CreateSubscriptionItem, CustomerApi, Deleted, InvoiceApi, InvoiceItemApi, ListCharges,
    ListSubscriptions, LiveStripeService, PaymentIntentApi, PaymentMethodApi, RefundApi,
    StripeResult, SubscriptionApi, SubscriptionItemApi, SubscriptionReconciler, TerminalApi,
    UpcomingInvoice, UpdatePaymentIntent, UpdateSubscription, CUSTOMER_SOURCES_EXPANSION,
    DEFAULT_CUSTOMER_CHARGE_LIMIT, DEFAULT_SUBSCRIPTION_LIST_LIMIT, INVOICE_EXPANSIONS,
    PAYMENT_INTENT_EXPANSIONS,
};
use crate::config::StripeSettings;

/// One handle per Stripe resource. Swap any of them independently in tests.
#[derive(Clone)]
pub struct StripeCollaborators {
    pub subscriptions: Arc<dyn SubscriptionApi>,
    pub subscription_items: Arc<dyn SubscriptionItemApi>,
    pub invoices: Arc<dyn InvoiceApi>,
    pub invoice_items: Arc<dyn InvoiceItemApi>,
    pub payment_intents: Arc<dyn PaymentIntentApi>,
    pub refunds: Arc<dyn RefundApi>,
    pub payment_methods: Arc<dyn PaymentMethodApi>,
    pub charges: Arc<dyn ChargeApi>,
    pub terminal: Arc<dyn TerminalApi>,
    pub customers: Arc<dyn CustomerApi>,
}

impl StripeCollaborators {
    /// Uses a single provider for every resource.
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: SubscriptionApi
            + SubscriptionItemApi
            + InvoiceApi
            + InvoiceItemApi
            + PaymentIntentApi
            + RefundApi
            + PaymentMethodApi
            + ChargeApi
            + TerminalApi
            + CustomerApi
            + 'static,
    {
        Self {
            subscriptions: provider.clone(),
            subscription_items: provider.clone(),
            invoices: provider.clone(),
            invoice_items: provider.clone(),
            payment_intents: provider.clone(),
            refunds: provider.clone(),
            payment_methods: provider.clone(),
            charges: provider.clone(),
            terminal: provider.clone(),
            customers: provider,
        }
    }
}

#[derive(Clone)]
pub struct StripeService {
    apis: StripeCollaborators,
    reconciler: SubscriptionReconciler,
}

impl StripeService {
    pub fn new(apis: StripeCollaborators) -> Self {
        let reconciler = SubscriptionReconciler::new(
            apis.subscriptions.clone(),
            apis.subscription_items.clone(),
            apis.invoices.clone(),
            apis.invoice_items.clone(),
        );
        Self { apis, reconciler }
    }

    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: SubscriptionApi
            + SubscriptionItemApi
            + InvoiceApi
            + InvoiceItemApi
            + PaymentIntentApi
            + RefundApi
            + PaymentMethodApi
            + ChargeApi
            + TerminalApi
            + CustomerApi
            + 'static,
    {
        Self::new(StripeCollaborators::from_provider(provider))
    }

    pub fn from_settings(settings: &StripeSettings) -> Self {
        Self::from_provider(Arc::new(LiveStripeService::from_settings(settings)))
    }

    // Subscriptions

    pub async fn list_subscriptions(&self, limit: Option<u64>) -> StripeResult<List<Subscription>> {
        let params = ListSubscriptions {
            limit: Some(limit.unwrap_or(DEFAULT_SUBSCRIPTION_LIST_LIMIT)),
            ..Default::default()
        };
        self.apis.subscriptions.list(params).await
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> StripeResult<Subscription> {
        self.apis.subscriptions.retrieve(subscription_id).await
    }

    /// Updates without proration and then removes stale items and invoice lines.
    /// See [`SubscriptionReconciler::reconcile_update`].
    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        update: UpdateSubscription,
    ) -> StripeResult<Subscription> {
        self.reconciler
            .reconcile_update(subscription_id, update)
            .await
    }

    /// Cancels immediately: no final invoice, no proration credit.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> StripeResult<Subscription> {
        info!(%subscription_id, "canceling subscription");
        self.apis
            .subscriptions
            .cancel(subscription_id, CancelSubscription::new())
            .await
    }

    pub async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> StripeResult<Subscription> {
        info!(%subscription_id, "scheduling subscription cancellation at period end");
        let update = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        self.apis.subscriptions.update(subscription_id, update).await
    }

    pub async fn create_subscription(
        &self,
        params: CreateSubscription,
    ) -> StripeResult<Subscription> {
        self.apis.subscriptions.create(params).await
    }

    pub async fn create_subscription_item(
        &self,
        params: CreateSubscriptionItem,
    ) -> StripeResult<SubscriptionItem> {
        self.apis.subscription_items.create(params).await
    }

    pub async fn delete_subscription_item(&self, item_id: &str) -> StripeResult<Deleted> {
        self.apis.subscription_items.delete(item_id).await
    }

    // Invoices

    /// Fetches an invoice with its charge, payment intent and subscription (and that
    /// subscription's default payment method) expanded.
    pub async fn get_invoice(&self, invoice_id: &str) -> StripeResult<Invoice> {
        self.apis
            .invoices
            .retrieve(invoice_id, INVOICE_EXPANSIONS)
            .await
    }

    pub async fn pay_invoice(&self, invoice_id: &str) -> StripeResult<Invoice> {
        info!(%invoice_id, "paying invoice");
        self.apis.invoices.pay(invoice_id).await
    }

    pub async fn get_upcoming_invoice(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> StripeResult<Invoice> {
        self.apis
            .invoices
            .upcoming(UpcomingInvoice::for_subscription(customer_id, subscription_id))
            .await
    }

    pub async fn delete_invoice_item(&self, invoice_item_id: &str) -> StripeResult<Deleted> {
        self.apis.invoice_items.delete(invoice_item_id).await
    }

    // Payment intents

    pub async fn get_payment_intent(&self, payment_intent_id: &str) -> StripeResult<PaymentIntent> {
        self.apis
            .payment_intents
            .retrieve(payment_intent_id, PAYMENT_INTENT_EXPANSIONS)
            .await
    }

    pub async fn create_payment_intent(
        &self,
        params: CreatePaymentIntent,
    ) -> StripeResult<PaymentIntent> {
        self.apis.payment_intents.create(params).await
    }

    pub async fn update_payment_intent(
        &self,
        payment_intent_id: &str,
        params: UpdatePaymentIntent,
    ) -> StripeResult<PaymentIntent> {
        self.apis
            .payment_intents
            .update(payment_intent_id, params)
            .await
    }

    pub async fn confirm_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> StripeResult<PaymentIntent> {
        info!(%payment_intent_id, "confirming payment intent");
        self.apis.payment_intents.confirm(payment_intent_id).await
    }

    pub async fn create_refund(&self, params: CreateRefund) -> StripeResult<Refund> {
        info!(
            charge = ?params.charge,
            payment_intent = ?params.payment_intent,
            amount = ?params.amount,
            "creating refund"
        );
        self.apis.refunds.create(params).await
    }

    // Payment methods

    pub async fn get_payment_method(&self, payment_method_id: &str) -> StripeResult<PaymentMethod> {
        self.apis.payment_methods.retrieve(payment_method_id).await
    }

    /// Card details (brand, last4, expiry) when the payment method is a card, `None` otherwise.
    pub async fn get_card_brand(
        &self,
        payment_method_id: &str,
    ) -> StripeResult<Option<CardDetails>> {
        let method = self.apis.payment_methods.retrieve(payment_method_id).await?;
        Ok(method.card)
    }

    // Charges

    pub async fn get_charge(&self, charge_id: &str) -> StripeResult<Charge> {
        self.apis.charges.retrieve(charge_id).await
    }

    /// Most recent charges for a customer, newest first. Defaults to just the latest one.
    pub async fn list_customer_charges(
        &self,
        customer_id: &str,
        limit: Option<u64>,
    ) -> StripeResult<List<Charge>> {
        let params = ListCharges {
            customer: Some(customer_id.to_string()),
            limit: Some(limit.unwrap_or(DEFAULT_CUSTOMER_CHARGE_LIMIT)),
        };
        self.apis.charges.list(params).await
    }

    // Terminal

    pub async fn create_connection_token(&self) -> StripeResult<TerminalConnectionToken> {
        self.apis.terminal.create_connection_token().await
    }

    // Customers

    pub async fn get_customer(&self, customer_id: &str) -> StripeResult<Customer> {
        self.apis.customers.retrieve(customer_id, &[]).await
    }

    pub async fn get_customer_payment_sources(&self, customer_id: &str) -> StripeResult<Customer> {
        self.apis
            .customers
            .retrieve(customer_id, CUSTOMER_SOURCES_EXPANSION)
            .await
    }
}

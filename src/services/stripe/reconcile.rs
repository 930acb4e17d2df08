use std::sync::Arc;

use dashmap::DashMap;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{InvoiceLineItem, Subscription, SubscriptionItem};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    InvoiceApi, InvoiceItemApi, StripeResult, SubscriptionApi, SubscriptionItemApi,
    UpcomingInvoice, UpdateSubscription,
};

/// Applies subscription updates and then prunes what Stripe leaves behind: every subscription
/// item except the newest one, and every upcoming invoice line that does not belong to the last
/// invoice item.
///
/// Cleanup is sequential and stops at the first failed deletion. Whatever remains is picked up by
/// the next reconciliation of the same subscription.
#[derive(Clone)]
pub struct SubscriptionReconciler {
    subscriptions: Arc<dyn SubscriptionApi>,
    subscription_items: Arc<dyn SubscriptionItemApi>,
    invoices: Arc<dyn InvoiceApi>,
    invoice_items: Arc<dyn InvoiceItemApi>,
    subscription_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SubscriptionReconciler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionApi>,
        subscription_items: Arc<dyn SubscriptionItemApi>,
        invoices: Arc<dyn InvoiceApi>,
        invoice_items: Arc<dyn InvoiceItemApi>,
    ) -> Self {
        Self {
            subscriptions,
            subscription_items,
            invoices,
            invoice_items,
            subscription_locks: Arc::new(DashMap::new()),
        }
    }

    /// Returns the subscription exactly as the update call answered, before any cleanup.
    pub async fn reconcile_update(
        &self,
        subscription_id: &str,
        update: UpdateSubscription,
    ) -> StripeResult<Subscription> {
        let lock = self
            .subscription_locks
            .entry(subscription_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.run_pass(subscription_id, update).await
        };

        drop(lock);
        // only the map still holds the lock once no other pass is queued on it
        self.subscription_locks
            .remove_if(subscription_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn run_pass(
        &self,
        subscription_id: &str,
        mut update: UpdateSubscription,
    ) -> StripeResult<Subscription> {
        update.proration_behavior = Some(SubscriptionProrationBehavior::None);
        info!(%subscription_id, items = update.items.len(), "updating subscription");

        let updated = self.subscriptions.update(subscription_id, update).await?;

        let current = self.subscriptions.retrieve(subscription_id).await?;
        let removed_items = self.prune_subscription_items(&current).await?;

        let customer_id = current.customer.id();
        let upcoming = self
            .invoices
            .upcoming(UpcomingInvoice::for_subscription(
                customer_id.as_str(),
                subscription_id,
            ))
            .await?;
        let lines = upcoming
            .lines
            .as_ref()
            .map(|lines| lines.data.as_slice())
            .unwrap_or_default();
        let removed_lines = self.prune_invoice_lines(subscription_id, lines).await?;

        info!(
            %subscription_id,
            removed_items,
            removed_lines,
            status = %updated.status,
            "subscription reconciled"
        );
        Ok(updated)
    }

    async fn prune_subscription_items(&self, subscription: &Subscription) -> StripeResult<usize> {
        let Some(latest) = latest_item(&subscription.items.data) else {
            return Ok(0);
        };

        let mut removed = 0;
        for item in subscription
            .items
            .data
            .iter()
            .filter(|item| item.id != latest.id)
        {
            debug!(subscription_id = %subscription.id, item_id = %item.id, kept = %latest.id, "deleting stale subscription item");
            if let Err(err) = self.subscription_items.delete(item.id.as_str()).await {
                warn!(?err, subscription_id = %subscription.id, item_id = %item.id, "failed to delete stale subscription item");
                return Err(err);
            }
            removed += 1;
        }
        Ok(removed)
    }

    async fn prune_invoice_lines(
        &self,
        subscription_id: &str,
        lines: &[InvoiceLineItem],
    ) -> StripeResult<usize> {
        let Some(last) = lines.last() else {
            return Ok(0);
        };
        let keep = invoice_item_of(last);

        let mut removed = 0;
        for line in lines.iter().filter(|line| invoice_item_of(line) != keep) {
            let target = deletion_target(line);
            debug!(%subscription_id, line_id = %line.id, %target, "deleting stale invoice line");
            if let Err(err) = self.invoice_items.delete(&target).await {
                warn!(?err, %subscription_id, line_id = %line.id, "failed to delete stale invoice line");
                return Err(err);
            }
            removed += 1;
        }
        Ok(removed)
    }
}

/// Newest item by creation time; equal timestamps go to the greatest id.
fn latest_item(items: &[SubscriptionItem]) -> Option<&SubscriptionItem> {
    items
        .iter()
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
}

fn invoice_item_of(line: &InvoiceLineItem) -> Option<stripe::InvoiceItemId> {
    line.invoice_item.as_ref().map(|item| item.id())
}

/// The invoice item behind a line; lines without one fall back to their own id.
fn deletion_target(line: &InvoiceLineItem) -> String {
    match invoice_item_of(line) {
        Some(item_id) => item_id.to_string(),
        None => line.id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::stripe::{
        CancelSubscription, CreateSubscription, CreateSubscriptionItem, Deleted,
        ListSubscriptions, MockStripeService, MockSubscriptionApi, MockSubscriptionItemApi,
        StripeServiceError, UpdateSubscriptionItems,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use stripe::{Expandable, Invoice, List};
    use tokio::sync::Notify;

    const YESTERDAY: i64 = 1_700_000_000;
    const NOW: i64 = YESTERDAY + 86_400;

    fn item(id: &str, created: i64) -> SubscriptionItem {
        SubscriptionItem {
            id: id.parse().unwrap(),
            created: Some(created),
            subscription: Some("sub_123".into()),
            ..Default::default()
        }
    }

    fn subscription(id: &str, items: Vec<SubscriptionItem>) -> Subscription {
        Subscription {
            id: id.parse().unwrap(),
            customer: Expandable::Id("cus_123".parse().unwrap()),
            items: List {
                data: items,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn line(id: &str, invoice_item: Option<&str>) -> InvoiceLineItem {
        InvoiceLineItem {
            id: id.parse().unwrap(),
            invoice_item: invoice_item.map(|item| Expandable::Id(item.parse().unwrap())),
            ..Default::default()
        }
    }

    fn upcoming(lines: Vec<InvoiceLineItem>) -> Invoice {
        Invoice {
            lines: Some(List {
                data: lines,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn line_count(mock: &MockStripeService, subscription_id: &str) -> usize {
        mock.upcoming_invoice(subscription_id)
            .and_then(|invoice| invoice.lines)
            .map_or(0, |lines| lines.data.len())
    }

    fn reconciler_for(mock: &MockStripeService) -> SubscriptionReconciler {
        let provider = Arc::new(mock.clone());
        SubscriptionReconciler::new(
            provider.clone(),
            provider.clone(),
            provider.clone(),
            provider,
        )
    }

    #[tokio::test]
    async fn keeps_only_the_newest_subscription_item() {
        let mock = MockStripeService::new()
            .with_subscription(subscription(
                "sub_123",
                vec![item("si_1", YESTERDAY), item("si_2", NOW)],
            ))
            .with_upcoming_invoice("sub_123", upcoming(vec![line("il_2", Some("ii_2"))]));

        reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(
            *mock.deleted_subscription_items.lock().unwrap(),
            vec!["si_1".to_string()]
        );
        let remaining = mock.subscription("sub_123").unwrap().items.data;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "si_2");
    }

    #[tokio::test]
    async fn keeps_only_the_last_upcoming_invoice_line() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_2", NOW)]))
            .with_upcoming_invoice(
                "sub_123",
                upcoming(vec![line("il_1", Some("ii_1")), line("il_2", Some("ii_2"))]),
            );

        reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(
            *mock.deleted_invoice_items.lock().unwrap(),
            vec!["ii_1".to_string()]
        );
        let lines = mock.upcoming_invoice("sub_123").unwrap().lines.unwrap().data;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, "il_2");
    }

    #[tokio::test]
    async fn lines_sharing_the_kept_invoice_item_survive() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_2", NOW)]))
            .with_upcoming_invoice(
                "sub_123",
                upcoming(vec![
                    line("sli_1", None),
                    line("il_2", Some("ii_old")),
                    line("sli_3", None),
                ]),
            );

        reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(
            *mock.deleted_invoice_items.lock().unwrap(),
            vec!["ii_old".to_string()]
        );
        assert_eq!(line_count(&mock, "sub_123"), 2);
    }

    #[tokio::test]
    async fn stale_lines_without_an_invoice_item_are_deleted_by_line_id() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_2", NOW)]))
            .with_upcoming_invoice(
                "sub_123",
                upcoming(vec![line("sli_1", None), line("il_2", Some("ii_2"))]),
            );

        reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(
            *mock.deleted_invoice_items.lock().unwrap(),
            vec!["sli_1".to_string()]
        );
    }

    #[tokio::test]
    async fn proration_is_always_disabled_on_the_outgoing_update() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_1", YESTERDAY)]))
            .with_upcoming_invoice("sub_123", upcoming(vec![]));

        let mut update = UpdateSubscription::new();
        update.proration_behavior = Some(SubscriptionProrationBehavior::AlwaysInvoice);
        reconciler_for(&mock)
            .reconcile_update("sub_123", update)
            .await
            .unwrap();

        let updates = mock.subscription_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "sub_123");
        assert_eq!(
            updates[0].1.proration_behavior,
            Some(SubscriptionProrationBehavior::None)
        );
    }

    #[tokio::test]
    async fn returns_the_update_response_not_the_cleaned_up_state() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_1", YESTERDAY)]))
            .with_upcoming_invoice("sub_123", upcoming(vec![]));

        let mut update = UpdateSubscription::new();
        update.items.push(UpdateSubscriptionItems {
            price: Some("price_pro".into()),
            ..Default::default()
        });
        let returned = reconciler_for(&mock)
            .reconcile_update("sub_123", update)
            .await
            .unwrap();

        assert_eq!(returned.items.data.len(), 2);
        let current = mock.subscription("sub_123").unwrap();
        assert_eq!(current.items.data.len(), 1);
        assert_eq!(
            current.items.data[0].price.as_ref().map(|p| p.id.as_str()),
            Some("price_pro")
        );
        assert_eq!(
            *mock.deleted_subscription_items.lock().unwrap(),
            vec!["si_1".to_string()]
        );
    }

    #[tokio::test]
    async fn equal_timestamps_keep_the_greatest_id() {
        let mock = MockStripeService::new()
            .with_subscription(subscription(
                "sub_123",
                vec![item("si_b", NOW), item("si_a", NOW), item("si_0", YESTERDAY)],
            ))
            .with_upcoming_invoice("sub_123", upcoming(vec![]));

        reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(
            *mock.deleted_subscription_items.lock().unwrap(),
            vec!["si_a".to_string(), "si_0".to_string()]
        );
        assert_eq!(mock.subscription("sub_123").unwrap().items.data[0].id, "si_b");
    }

    #[tokio::test]
    async fn failed_item_deletion_aborts_and_propagates() {
        let mock = MockStripeService::new()
            .with_subscription(subscription(
                "sub_123",
                vec![
                    item("si_1", YESTERDAY),
                    item("si_2", YESTERDAY + 1),
                    item("si_3", NOW),
                ],
            ))
            .with_upcoming_invoice(
                "sub_123",
                upcoming(vec![line("il_1", Some("ii_1")), line("il_3", Some("ii_3"))]),
            )
            .fail_delete_of("si_1");

        let err = reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StripeServiceError::Provider(_)));
        // nothing after the failure runs
        assert!(mock.deleted_subscription_items.lock().unwrap().is_empty());
        assert!(mock.deleted_invoice_items.lock().unwrap().is_empty());
        assert_eq!(mock.subscription("sub_123").unwrap().items.data.len(), 3);
    }

    #[tokio::test]
    async fn failed_line_deletion_propagates() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_2", NOW)]))
            .with_upcoming_invoice(
                "sub_123",
                upcoming(vec![line("il_1", Some("ii_1")), line("il_2", Some("ii_2"))]),
            )
            .fail_delete_of("ii_1");

        let err = reconciler_for(&mock)
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StripeServiceError::Provider(_)));
        assert_eq!(line_count(&mock, "sub_123"), 2);
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let mock = MockStripeService::new();
        let reconciler = reconciler_for(&mock);

        let err = reconciler
            .reconcile_update("sub_missing", UpdateSubscription::new())
            .await
            .unwrap_err();

        assert!(matches!(err, StripeServiceError::NotFound(_)));
        assert!(mock.deleted_subscription_items.lock().unwrap().is_empty());
        assert!(reconciler.subscription_locks.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_is_dropped_after_the_pass() {
        let mock = MockStripeService::new()
            .with_subscription(subscription("sub_123", vec![item("si_1", NOW)]))
            .with_upcoming_invoice("sub_123", upcoming(vec![]));
        let reconciler = reconciler_for(&mock);

        reconciler
            .reconcile_update("sub_123", UpdateSubscription::new())
            .await
            .unwrap();

        assert!(reconciler.subscription_locks.is_empty());
    }

    #[tokio::test]
    async fn single_item_subscription_deletes_nothing() {
        let solo = subscription("sub_solo", vec![item("si_1", NOW)]);

        let mut subscriptions = MockSubscriptionApi::new();
        let updated = solo.clone();
        subscriptions
            .expect_update()
            .withf(|_, params| {
                params.proration_behavior == Some(SubscriptionProrationBehavior::None)
            })
            .times(1)
            .returning(move |_, _| Ok(updated.clone()));
        let fetched = solo.clone();
        subscriptions
            .expect_retrieve()
            .times(1)
            .returning(move |_| Ok(fetched.clone()));

        let mut items = MockSubscriptionItemApi::new();
        items.expect_delete().never();

        let invoices = Arc::new(
            MockStripeService::new()
                .with_upcoming_invoice("sub_solo", upcoming(vec![line("il_1", Some("ii_1"))])),
        );

        let reconciler = SubscriptionReconciler::new(
            Arc::new(subscriptions),
            Arc::new(items),
            invoices.clone(),
            invoices.clone(),
        );
        let result = reconciler
            .reconcile_update("sub_solo", UpdateSubscription::new())
            .await
            .unwrap();

        assert_eq!(result.id, solo.id);
        assert_eq!(result.items.data.len(), 1);
        assert!(invoices.deleted_invoice_items.lock().unwrap().is_empty());
    }

    /// Records calls and parks the first subscription item deletion until released.
    struct GatedProvider {
        inner: MockStripeService,
        events: std::sync::Mutex<Vec<String>>,
        armed: AtomicBool,
        delete_started: Notify,
        release: Notify,
    }

    impl GatedProvider {
        fn new(inner: MockStripeService) -> Self {
            Self {
                inner,
                events: std::sync::Mutex::new(Vec::new()),
                armed: AtomicBool::new(true),
                delete_started: Notify::new(),
                release: Notify::new(),
            }
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SubscriptionApi for GatedProvider {
        async fn list(&self, params: ListSubscriptions) -> StripeResult<List<Subscription>> {
            SubscriptionApi::list(&self.inner, params).await
        }

        async fn retrieve(&self, subscription_id: &str) -> StripeResult<Subscription> {
            SubscriptionApi::retrieve(&self.inner, subscription_id).await
        }

        async fn update(
            &self,
            subscription_id: &str,
            params: UpdateSubscription,
        ) -> StripeResult<Subscription> {
            self.record(format!("update:{subscription_id}"));
            SubscriptionApi::update(&self.inner, subscription_id, params).await
        }

        async fn cancel(
            &self,
            subscription_id: &str,
            params: CancelSubscription,
        ) -> StripeResult<Subscription> {
            SubscriptionApi::cancel(&self.inner, subscription_id, params).await
        }

        async fn create(&self, params: CreateSubscription) -> StripeResult<Subscription> {
            SubscriptionApi::create(&self.inner, params).await
        }
    }

    #[async_trait]
    impl SubscriptionItemApi for GatedProvider {
        async fn create(&self, params: CreateSubscriptionItem) -> StripeResult<SubscriptionItem> {
            SubscriptionItemApi::create(&self.inner, params).await
        }

        async fn delete(&self, item_id: &str) -> StripeResult<Deleted> {
            self.record(format!("delete:{item_id}"));
            if self.armed.swap(false, Ordering::SeqCst) {
                self.delete_started.notify_one();
                self.release.notified().await;
            }
            let deleted = SubscriptionItemApi::delete(&self.inner, item_id).await;
            self.record(format!("deleted:{item_id}"));
            deleted
        }
    }

    #[tokio::test]
    async fn concurrent_updates_of_one_subscription_run_one_after_another() {
        let mock = MockStripeService::new()
            .with_subscription(subscription(
                "sub_123",
                vec![item("si_1", YESTERDAY), item("si_2", NOW)],
            ))
            .with_subscription(subscription("sub_456", vec![item("si_9", NOW)]))
            .with_upcoming_invoice("sub_123", upcoming(vec![]))
            .with_upcoming_invoice("sub_456", upcoming(vec![]));
        let gated = Arc::new(GatedProvider::new(mock.clone()));
        let invoices = Arc::new(mock.clone());
        let reconciler =
            SubscriptionReconciler::new(gated.clone(), gated.clone(), invoices.clone(), invoices);

        let first = tokio::spawn({
            let reconciler = reconciler.clone();
            async move {
                reconciler
                    .reconcile_update("sub_123", UpdateSubscription::new())
                    .await
            }
        });
        gated.delete_started.notified().await;

        let second = tokio::spawn({
            let reconciler = reconciler.clone();
            async move {
                reconciler
                    .reconcile_update("sub_123", UpdateSubscription::new())
                    .await
            }
        });

        // another subscription is not held up by the parked pass
        reconciler
            .reconcile_update("sub_456", UpdateSubscription::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            gated.events(),
            vec![
                "update:sub_123".to_string(),
                "delete:si_1".to_string(),
                "update:sub_456".to_string(),
            ]
        );

        gated.release.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let events = gated.events();
        let finished_delete = events.iter().position(|e| e == "deleted:si_1").unwrap();
        let second_update = events.iter().rposition(|e| e == "update:sub_123").unwrap();
        assert!(second_update > finished_delete, "events: {events:?}");
        assert_eq!(events.iter().filter(|e| *e == "update:sub_123").count(), 2);
        assert!(reconciler.subscription_locks.is_empty());
    }

    #[test]
    fn latest_item_of_empty_list_is_none() {
        assert!(latest_item(&[]).is_none());
    }
}

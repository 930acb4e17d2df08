use std::env;

use anyhow::{bail, Context, Result};

use stripe_client_service::config::Config;
use stripe_client_service::logging::init_tracing;
use stripe_client_service::services::stripe::{
    StripeService, UpdateSubscription, UpdateSubscriptionItems,
};

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(subscription_id) = args.next() else {
        bail!("usage: reconcile_subscription <subscription_id> [price_id]");
    };
    let price_id = args.next();

    let config = Config::from_env().context("failed to load Stripe configuration")?;
    init_tracing(config.log_format)?;

    let service = StripeService::from_settings(&config.stripe);

    let mut update = UpdateSubscription::new();
    if let Some(price) = price_id {
        update.items.push(UpdateSubscriptionItems {
            price: Some(price),
            ..Default::default()
        });
    }

    let subscription = service
        .update_subscription(&subscription_id, update)
        .await
        .with_context(|| format!("failed to reconcile subscription {subscription_id}"))?;

    println!(
        "Reconciled {} (status {}, {} item(s) in update response)",
        subscription.id,
        subscription.status,
        subscription.items.data.len()
    );

    Ok(())
}

//! Approval notifications and the user-decision channel
//!
//! The notifier is the outbound half of the approval loop: it announces
//! READY trades and status events. Decisions come back through an mpsc
//! channel whose sender is handed to whatever front end drives the bot.
//! Delivery failures are logged and never fatal.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::types::{MarketWindow, Signal, Trade, UserDecision};

/// Outbound notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a READY trade awaiting a decision.
    async fn emit_approval(&self, trade: &Trade, signal: &Signal, window: &MarketWindow);

    /// Terse status event (signal accepted, order filled, settlement).
    async fn notify(&self, message: &str);
}

/// Handle used by front ends to deliver OK/SKIP decisions.
pub type DecisionSender = mpsc::Sender<UserDecision>;

/// Build the decision channel wired into the orchestrator.
pub fn decision_channel() -> (DecisionSender, mpsc::Receiver<UserDecision>) {
    mpsc::channel(64)
}

/// Webhook notifier posting JSON embeds.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    async fn post(&self, payload: serde_json::Value) {
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => error!("Webhook delivery failed: {}", response.status()),
            Err(e) => error!("Webhook delivery failed: {}", e),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn emit_approval(&self, trade: &Trade, signal: &Signal, window: &MarketWindow) {
        let payload = json!({
            "embeds": [{
                "title": format!("Trade #{} awaiting approval", trade.id),
                "description": format!(
                    "{} {} in window `{}`",
                    window.asset, signal.direction, window.slug
                ),
                "color": 0xF5A623,
                "fields": [
                    {"name": "Quality", "value": format!("{:.2}", signal.quality), "inline": true},
                    {"name": "Confirm", "value": signal.confirm_ts.to_string(), "inline": true},
                    {"name": "Window ends", "value": window.end_ts.to_string(), "inline": true},
                    {"name": "Stake", "value": trade.stake_amount.to_string(), "inline": true},
                ],
                "footer": {"text": "Reply OK or SKIP"}
            }]
        });
        self.post(payload).await;
        info!("Approval card emitted for trade {}", trade.id);
    }

    async fn notify(&self, message: &str) {
        self.post(json!({ "content": message })).await;
    }
}

/// Notifier for headless runs and tests: log only.
#[derive(Debug, Default, Clone)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn emit_approval(&self, trade: &Trade, signal: &Signal, _window: &MarketWindow) {
        info!(
            "Approval requested for trade {} ({} q={:.2})",
            trade.id, signal.direction, signal.quality
        );
    }

    async fn notify(&self, message: &str) {
        info!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decision_channel_delivers_in_order() {
        let (sender, mut receiver) = decision_channel();
        sender
            .send(UserDecision {
                trade_id: 1,
                approve: true,
            })
            .await
            .unwrap();
        sender
            .send(UserDecision {
                trade_id: 2,
                approve: false,
            })
            .await
            .unwrap();

        assert_eq!(receiver.recv().await.unwrap().trade_id, 1);
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.trade_id, 2);
        assert!(!second.approve);
    }
}

//! CAP evaluation
//!
//! Entry-price validation over `[confirm_ts, end_ts]`: the trade may only
//! proceed once `cap_min_ticks` consecutive book ticks print at or below the
//! price cap. Ticks before `confirm_ts` never count, and a single print
//! above the cap invalidates the running streak.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clients::BookClient;
use crate::db::Database;
use crate::types::{CapCheck, CapStatus, PriceTick};

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CapOutcome {
    pub status: CapStatus,
    pub consecutive_ticks: i64,
    pub first_pass_ts: Option<i64>,
    pub price_at_pass: Option<Decimal>,
}

/// Pure CAP evaluation.
///
/// Ticks are filtered to `[confirm_ts, end_ts]`, sorted ascending (stable,
/// so duplicate timestamps keep arrival order), and scanned for the first
/// run of `cap_min_ticks` consecutive prints with `price <= price_cap`.
/// Equality counts. PASS records the tick that completes the run. With no
/// pass, FAIL once `now >= end_ts`, PENDING before that; LATE when the
/// window closed before the check could start.
pub fn evaluate_cap(
    ticks: &[PriceTick],
    confirm_ts: i64,
    end_ts: i64,
    price_cap: Decimal,
    cap_min_ticks: i64,
    now: i64,
) -> CapOutcome {
    if confirm_ts >= end_ts {
        return CapOutcome {
            status: CapStatus::Late,
            consecutive_ticks: 0,
            first_pass_ts: None,
            price_at_pass: None,
        };
    }

    let mut in_window: Vec<&PriceTick> = ticks
        .iter()
        .filter(|tick| tick.ts >= confirm_ts && tick.ts <= end_ts)
        .collect();
    in_window.sort_by_key(|tick| tick.ts);

    let mut run: i64 = 0;
    for tick in in_window {
        if tick.price <= price_cap {
            run += 1;
            if run >= cap_min_ticks {
                return CapOutcome {
                    status: CapStatus::Pass,
                    consecutive_ticks: run,
                    first_pass_ts: Some(tick.ts),
                    price_at_pass: Some(tick.price),
                };
            }
        } else {
            run = 0;
        }
    }

    let status = if now >= end_ts {
        CapStatus::Fail
    } else {
        CapStatus::Pending
    };
    CapOutcome {
        status,
        consecutive_ticks: run,
        first_pass_ts: None,
        price_at_pass: None,
    }
}

/// Persistence wrapper: lazily creates the per-trade CapCheck row, fetches
/// book ticks and records verdicts.
pub struct CapCheckService {
    db: Database,
    book: Arc<dyn BookClient>,
    price_cap: Decimal,
    cap_min_ticks: i64,
}

impl CapCheckService {
    pub fn new(
        db: Database,
        book: Arc<dyn BookClient>,
        price_cap: Decimal,
        cap_min_ticks: i64,
    ) -> Self {
        Self {
            db,
            book,
            price_cap,
            cap_min_ticks,
        }
    }

    /// Create the CapCheck for a trade if absent (idempotent on trade id).
    /// A check born with `confirm_ts >= end_ts` is LATE from the start.
    pub async fn ensure_check(
        &self,
        trade_id: i64,
        token_id: &str,
        confirm_ts: i64,
        end_ts: i64,
    ) -> Result<CapCheck> {
        let initial = if confirm_ts >= end_ts {
            CapStatus::Late
        } else {
            CapStatus::Pending
        };
        self.db
            .ensure_cap_check(trade_id, token_id, confirm_ts, end_ts, initial)
            .await
    }

    /// Re-evaluate a pending check against fresh book ticks and persist the
    /// result. Settled checks are returned unchanged.
    pub async fn evaluate(&self, check: &CapCheck, now: i64) -> Result<CapCheck> {
        if check.status != CapStatus::Pending {
            return Ok(check.clone());
        }

        let to_ts = now.min(check.end_ts);
        let ticks = self
            .book
            .price_ticks(&check.token_id, check.confirm_ts, to_ts)
            .await?;

        debug!(
            "Cap check {}: {} ticks in [{}, {}]",
            check.id,
            ticks.len(),
            check.confirm_ts,
            to_ts
        );

        let outcome = evaluate_cap(
            &ticks,
            check.confirm_ts,
            check.end_ts,
            self.price_cap,
            self.cap_min_ticks,
            now,
        );

        let mut updated = check.clone();
        updated.status = outcome.status;
        updated.consecutive_ticks = outcome.consecutive_ticks;
        updated.first_pass_ts = outcome.first_pass_ts;
        updated.price_at_pass = outcome.price_at_pass;
        self.db.update_cap_check(&updated).await?;

        if updated.status != CapStatus::Pending {
            info!(
                "Cap check {} -> {} (run={}, required={})",
                updated.id, updated.status, updated.consecutive_ticks, self.cap_min_ticks
            );
        }
        Ok(updated)
    }
}

//! SQLite trade ledger
//!
//! Single writer for windows, signals, trades, CAP checks, the stats
//! singleton and runtime settings. Every status change goes through
//! `transition`, which re-checks legality inside a transaction; the
//! settlement path writes the trade row and the stats row atomically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::state_machine::ensure_legal;
use crate::types::{
    CancelReason, CapCheck, CapStatus, Decision, Direction, FillStatus, MarketWindow, PolicyMode,
    QualityBreakdown, Signal, Stats, TimeMode, Trade, TradeStatus,
};

/// Migration scripts, applied in order and recorded in `migrations`.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS market_windows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        asset TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        condition_id TEXT NOT NULL,
        up_token_id TEXT NOT NULL,
        down_token_id TEXT NOT NULL,
        start_ts INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        outcome TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_market_windows_asset ON market_windows(asset);
    CREATE INDEX IF NOT EXISTS idx_market_windows_end_ts ON market_windows(end_ts);

    CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        window_id INTEGER NOT NULL UNIQUE,
        direction TEXT NOT NULL,
        signal_ts INTEGER NOT NULL,
        confirm_ts INTEGER NOT NULL,
        quality REAL NOT NULL,
        quality_breakdown TEXT,
        anchor_bar_ts INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (window_id) REFERENCES market_windows(id)
    );

    CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        window_id INTEGER NOT NULL,
        signal_id INTEGER,
        status TEXT NOT NULL DEFAULT 'NEW',
        time_mode TEXT,
        policy_mode TEXT NOT NULL DEFAULT 'BASE',
        decision TEXT NOT NULL DEFAULT 'PENDING',
        cancel_reason TEXT,
        token_id TEXT,
        order_id TEXT,
        fill_status TEXT NOT NULL DEFAULT 'PENDING',
        fill_price TEXT,
        stake_amount TEXT NOT NULL DEFAULT '0',
        pnl TEXT,
        is_win INTEGER,
        trade_level_streak INTEGER NOT NULL DEFAULT 0,
        night_streak INTEGER NOT NULL DEFAULT 0,
        approval_emitted_ts INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (window_id) REFERENCES market_windows(id),
        FOREIGN KEY (signal_id) REFERENCES signals(id)
    );

    CREATE INDEX IF NOT EXISTS idx_trades_window_id ON trades(window_id);
    CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_window_nonterminal
        ON trades(window_id)
        WHERE status NOT IN ('SETTLED', 'CANCELLED', 'ERROR');

    CREATE TABLE IF NOT EXISTS cap_checks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trade_id INTEGER NOT NULL UNIQUE,
        token_id TEXT NOT NULL,
        confirm_ts INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        consecutive_ticks INTEGER NOT NULL DEFAULT 0,
        first_pass_ts INTEGER,
        price_at_pass TEXT,
        created_at TEXT NOT NULL,
        FOREIGN KEY (trade_id) REFERENCES trades(id)
    );

    CREATE TABLE IF NOT EXISTS stats (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        trade_level_streak INTEGER NOT NULL DEFAULT 0,
        night_streak INTEGER NOT NULL DEFAULT 0,
        policy_mode TEXT NOT NULL DEFAULT 'BASE',
        total_trades INTEGER NOT NULL DEFAULT 0,
        total_wins INTEGER NOT NULL DEFAULT 0,
        total_losses INTEGER NOT NULL DEFAULT 0,
        last_strict_day_threshold REAL,
        last_strict_night_threshold REAL,
        last_quantile_update_ts INTEGER,
        is_paused INTEGER NOT NULL DEFAULT 0,
        day_only INTEGER NOT NULL DEFAULT 0,
        night_only INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL DEFAULT '1970-01-01T00:00:00Z'
    );

    INSERT OR IGNORE INTO stats (id) VALUES (1);

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS migrations (
        id INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    );
"#];

/// Field updates applied together with a status transition (or alone via
/// `update_trade`). `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TradeUpdate {
    pub signal_id: Option<i64>,
    pub decision: Option<Decision>,
    pub cancel_reason: Option<CancelReason>,
    pub token_id: Option<String>,
    pub order_id: Option<String>,
    pub fill_status: Option<FillStatus>,
    pub fill_price: Option<Decimal>,
    pub stake_amount: Option<Decimal>,
    pub approval_emitted_ts: Option<i64>,
}

impl TradeUpdate {
    fn apply(&self, trade: &mut Trade) {
        if let Some(signal_id) = self.signal_id {
            trade.signal_id = Some(signal_id);
        }
        if let Some(decision) = self.decision {
            trade.decision = decision;
        }
        if let Some(reason) = self.cancel_reason {
            trade.cancel_reason = Some(reason);
        }
        if let Some(token_id) = &self.token_id {
            trade.token_id = Some(token_id.clone());
        }
        if let Some(order_id) = &self.order_id {
            trade.order_id = Some(order_id.clone());
        }
        if let Some(fill_status) = self.fill_status {
            trade.fill_status = fill_status;
        }
        if let Some(fill_price) = self.fill_price {
            trade.fill_price = Some(fill_price);
        }
        if let Some(stake) = self.stake_amount {
            trade.stake_amount = stake;
        }
        if let Some(ts) = self.approval_emitted_ts {
            trade.approval_emitted_ts = Some(ts);
        }
    }
}

/// Ledger handle backed by a SQLite pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the database at `path`.
    /// `sqlite::memory:` is supported for tests.
    pub async fn new(path: &str) -> Result<Self> {
        let in_memory = path.contains(":memory:");

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !in_memory && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let mut options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // An in-memory database exists per connection; keep a single one.
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open ledger database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Apply pending migrations, each recorded in the `migrations` table.
    async fn run_migrations(&self) -> Result<()> {
        // Bootstrap the tracking table so the applied set can be read.
        sqlx::query("CREATE TABLE IF NOT EXISTS migrations (id INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)")
            .execute(&self.pool)
            .await?;

        let applied: Vec<i64> = sqlx::query_scalar("SELECT id FROM migrations")
            .fetch_all(&self.pool)
            .await?;

        for (idx, script) in MIGRATIONS.iter().enumerate() {
            let id = (idx + 1) as i64;
            if applied.contains(&id) {
                continue;
            }
            info!("Applying ledger migration {}", id);
            sqlx::raw_sql(script)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration {} failed", id))?;
            sqlx::query("INSERT INTO migrations (id, applied_at) VALUES (?, ?)")
                .bind(id)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ==================== market windows ====================

    /// Insert a newly discovered window. The caller is expected to have
    /// checked for an existing slug; a duplicate insert surfaces as an error
    /// through the UNIQUE constraint.
    pub async fn insert_window(
        &self,
        asset: &str,
        slug: &str,
        condition_id: &str,
        up_token_id: &str,
        down_token_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<MarketWindow> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO market_windows
                (asset, slug, condition_id, up_token_id, down_token_id, start_ts, end_ts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(asset)
        .bind(slug)
        .bind(condition_id)
        .bind(up_token_id)
        .bind(down_token_id)
        .bind(start_ts)
        .bind(end_ts)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert market window")?;

        let id = result.last_insert_rowid();
        debug!("Inserted window {} ({} {})", id, asset, slug);
        self.window_by_id(id)
            .await?
            .context("window vanished after insert")
    }

    pub async fn window_by_id(&self, id: i64) -> Result<Option<MarketWindow>> {
        let row = sqlx::query("SELECT * FROM market_windows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_window).transpose()
    }

    pub async fn window_by_slug(&self, slug: &str) -> Result<Option<MarketWindow>> {
        let row = sqlx::query("SELECT * FROM market_windows WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_window).transpose()
    }

    /// Record the resolved outcome; a window resolves exactly once.
    pub async fn set_window_outcome(&self, window_id: i64, outcome: Direction) -> Result<()> {
        sqlx::query("UPDATE market_windows SET outcome = ? WHERE id = ? AND outcome IS NULL")
            .bind(outcome.to_string())
            .bind(window_id)
            .execute(&self.pool)
            .await?;
        info!("Window {} resolved {}", window_id, outcome);
        Ok(())
    }

    // ==================== signals ====================

    /// Persist a signal for a window. The UNIQUE constraint on `window_id`
    /// enforces at most one signal per window.
    pub async fn insert_signal(
        &self,
        window_id: i64,
        direction: Direction,
        signal_ts: i64,
        confirm_ts: i64,
        quality: f64,
        breakdown: &QualityBreakdown,
        anchor_bar_ts: i64,
    ) -> Result<Signal> {
        let breakdown_json = serde_json::to_string(breakdown)?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO signals
                (window_id, direction, signal_ts, confirm_ts, quality, quality_breakdown, anchor_bar_ts, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(window_id)
        .bind(direction.to_string())
        .bind(signal_ts)
        .bind(confirm_ts)
        .bind(quality)
        .bind(breakdown_json)
        .bind(anchor_bar_ts)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert signal")?;

        let id = result.last_insert_rowid();
        info!(
            "Signal {} persisted for window {} ({} q={:.2})",
            id, window_id, direction, quality
        );
        self.signal_by_id(id)
            .await?
            .context("signal vanished after insert")
    }

    pub async fn signal_by_id(&self, id: i64) -> Result<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_signal).transpose()
    }

    pub async fn signal_for_window(&self, window_id: i64) -> Result<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE window_id = ?")
            .bind(window_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_signal).transpose()
    }

    // ==================== trades ====================

    /// Create a trade in NEW for a window, snapshotting the current streaks.
    /// The partial unique index refuses a second non-terminal trade for the
    /// same window.
    pub async fn create_trade(
        &self,
        window_id: i64,
        time_mode: TimeMode,
        policy_mode: PolicyMode,
        trade_level_streak: i64,
        night_streak: i64,
    ) -> Result<Trade> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO trades
                (window_id, status, time_mode, policy_mode, trade_level_streak, night_streak,
                 created_at, updated_at)
            VALUES (?, 'NEW', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(window_id)
        .bind(time_mode.to_string())
        .bind(policy_mode.to_string())
        .bind(trade_level_streak)
        .bind(night_streak)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert trade (duplicate non-terminal trade for window?)")?;

        let id = result.last_insert_rowid();
        info!("Trade {} created for window {}", id, window_id);
        self.trade_by_id(id)
            .await?
            .context("trade vanished after insert")
    }

    pub async fn trade_by_id(&self, id: i64) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_trade).transpose()
    }

    pub async fn non_terminal_trade_for_window(&self, window_id: i64) -> Result<Option<Trade>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE window_id = ?
              AND status NOT IN ('SETTLED', 'CANCELLED', 'ERROR')
            LIMIT 1
            "#,
        )
        .bind(window_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_trade).transpose()
    }

    /// All non-terminal trades, oldest first.
    pub async fn active_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trades
            WHERE status NOT IN ('SETTLED', 'CANCELLED', 'ERROR')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_trade).collect()
    }

    pub async fn trades_with_status(&self, status: TradeStatus) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = ? ORDER BY id")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_trade).collect()
    }

    pub async fn settled_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = 'SETTLED' ORDER BY updated_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_trade).collect()
    }

    /// Apply a status transition with attached field updates.
    ///
    /// Inside one transaction: re-read the row, verify the edge against the
    /// state machine, write the full row. Illegal transitions leave the row
    /// untouched and surface as errors.
    pub async fn transition(
        &self,
        trade_id: i64,
        to: TradeStatus,
        update: TradeUpdate,
    ) -> Result<Trade> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("trade {} not found", trade_id))?;
        let mut trade = row_to_trade(row)?;
        let from = trade.status;

        ensure_legal(from, to).map_err(|violation| anyhow::anyhow!(violation))?;

        update.apply(&mut trade);
        trade.status = to;
        trade.updated_at = Utc::now();

        write_trade_row(&mut tx, &trade).await?;
        tx.commit().await?;

        info!("Trade {} {} -> {}", trade_id, from, to);
        Ok(trade)
    }

    /// Update trade fields without changing status (decision intake, fill
    /// recording, approval emission timestamps).
    pub async fn update_trade(&self, trade_id: i64, update: TradeUpdate) -> Result<Trade> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("trade {} not found", trade_id))?;
        let mut trade = row_to_trade(row)?;

        update.apply(&mut trade);
        trade.updated_at = Utc::now();

        write_trade_row(&mut tx, &trade).await?;
        tx.commit().await?;
        Ok(trade)
    }

    /// Settle a trade: write SETTLED + is_win + pnl and the new stats row in
    /// a single transaction, so streaks can never drift from outcomes.
    pub async fn settle_trade(
        &self,
        trade_id: i64,
        is_win: bool,
        pnl: Decimal,
        new_stats: &Stats,
    ) -> Result<Trade> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(&mut *tx)
            .await?
            .with_context(|| format!("trade {} not found", trade_id))?;
        let mut trade = row_to_trade(row)?;
        let from = trade.status;

        ensure_legal(from, TradeStatus::Settled).map_err(|violation| anyhow::anyhow!(violation))?;

        trade.status = TradeStatus::Settled;
        trade.is_win = Some(is_win);
        trade.pnl = Some(pnl);
        trade.updated_at = Utc::now();

        write_trade_row(&mut tx, &trade).await?;
        write_stats_row(&mut tx, new_stats).await?;
        tx.commit().await?;

        info!(
            "Trade {} settled: {} pnl={}",
            trade_id,
            if is_win { "WIN" } else { "LOSS" },
            pnl
        );
        Ok(trade)
    }

    // ==================== cap checks ====================

    /// Create the CAP check for a trade if it does not already exist.
    pub async fn ensure_cap_check(
        &self,
        trade_id: i64,
        token_id: &str,
        confirm_ts: i64,
        end_ts: i64,
        status: CapStatus,
    ) -> Result<CapCheck> {
        if let Some(existing) = self.cap_check_for_trade(trade_id).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO cap_checks (trade_id, token_id, confirm_ts, end_ts, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(trade_id) DO NOTHING
            "#,
        )
        .bind(trade_id)
        .bind(token_id)
        .bind(confirm_ts)
        .bind(end_ts)
        .bind(status.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.cap_check_for_trade(trade_id)
            .await?
            .context("cap check vanished after insert")
    }

    pub async fn cap_check_for_trade(&self, trade_id: i64) -> Result<Option<CapCheck>> {
        let row = sqlx::query("SELECT * FROM cap_checks WHERE trade_id = ?")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_cap_check).transpose()
    }

    pub async fn update_cap_check(&self, check: &CapCheck) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cap_checks SET
                status = ?, consecutive_ticks = ?, first_pass_ts = ?, price_at_pass = ?
            WHERE id = ?
            "#,
        )
        .bind(check.status.to_string())
        .bind(check.consecutive_ticks)
        .bind(check.first_pass_ts)
        .bind(check.price_at_pass.map(|p| p.to_string()))
        .bind(check.id)
        .execute(&self.pool)
        .await?;
        debug!("Cap check {} -> {}", check.id, check.status);
        Ok(())
    }

    // ==================== stats ====================

    pub async fn stats(&self) -> Result<Stats> {
        let row = sqlx::query("SELECT * FROM stats WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .context("stats singleton missing")?;
        row_to_stats(row)
    }

    pub async fn update_stats(&self, stats: &Stats) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_stats_row(&mut tx, stats).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Signal qualities of taken-and-filled trades for a time mode since
    /// `since_ts`, newest first, used by the rolling-quantile threshold.
    pub async fn filled_qualities(
        &self,
        time_mode: TimeMode,
        since_ts: i64,
        limit: i64,
    ) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            r#"
            SELECT s.quality AS quality
            FROM trades t
            JOIN signals s ON s.id = t.signal_id
            WHERE t.decision IN ('OK', 'AUTO_OK')
              AND t.fill_status IN ('FILLED', 'PARTIAL')
              AND t.time_mode = ?
              AND t.created_at >= ?
            ORDER BY t.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(time_mode.to_string())
        .bind(DateTime::<Utc>::from_timestamp(since_ts, 0).unwrap_or_default())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<f64, _>("quality"))
            .collect())
    }

    // ==================== settings ====================

    pub async fn setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        info!("Setting {} = {}", key, value);
        Ok(())
    }

    pub async fn all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
            .collect())
    }
}

async fn write_trade_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    trade: &Trade,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE trades SET
            signal_id = ?, status = ?, time_mode = ?, policy_mode = ?, decision = ?,
            cancel_reason = ?, token_id = ?, order_id = ?, fill_status = ?, fill_price = ?,
            stake_amount = ?, pnl = ?, is_win = ?, trade_level_streak = ?, night_streak = ?,
            approval_emitted_ts = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(trade.signal_id)
    .bind(trade.status.to_string())
    .bind(trade.time_mode.map(|m| m.to_string()))
    .bind(trade.policy_mode.to_string())
    .bind(trade.decision.to_string())
    .bind(trade.cancel_reason.map(|r| r.to_string()))
    .bind(trade.token_id.clone())
    .bind(trade.order_id.clone())
    .bind(trade.fill_status.to_string())
    .bind(trade.fill_price.map(|p| p.to_string()))
    .bind(trade.stake_amount.to_string())
    .bind(trade.pnl.map(|p| p.to_string()))
    .bind(trade.is_win.map(i64::from))
    .bind(trade.trade_level_streak)
    .bind(trade.night_streak)
    .bind(trade.approval_emitted_ts)
    .bind(trade.updated_at)
    .bind(trade.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_stats_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    stats: &Stats,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE stats SET
            trade_level_streak = ?, night_streak = ?, policy_mode = ?,
            total_trades = ?, total_wins = ?, total_losses = ?,
            last_strict_day_threshold = ?, last_strict_night_threshold = ?,
            last_quantile_update_ts = ?, is_paused = ?, day_only = ?, night_only = ?,
            updated_at = ?
        WHERE id = 1
        "#,
    )
    .bind(stats.trade_level_streak)
    .bind(stats.night_streak)
    .bind(stats.policy_mode.to_string())
    .bind(stats.total_trades)
    .bind(stats.total_wins)
    .bind(stats.total_losses)
    .bind(stats.last_strict_day_threshold)
    .bind(stats.last_strict_night_threshold)
    .bind(stats.last_quantile_update_ts)
    .bind(stats.is_paused as i64)
    .bind(stats.day_only as i64)
    .bind(stats.night_only as i64)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_window(row: SqliteRow) -> Result<MarketWindow> {
    let outcome: Option<String> = row.get("outcome");
    Ok(MarketWindow {
        id: row.get("id"),
        asset: row.get("asset"),
        slug: row.get("slug"),
        condition_id: row.get("condition_id"),
        up_token_id: row.get("up_token_id"),
        down_token_id: row.get("down_token_id"),
        start_ts: row.get("start_ts"),
        end_ts: row.get("end_ts"),
        outcome: outcome.map(|o| o.parse()).transpose()?,
        created_at: row.get("created_at"),
    })
}

fn row_to_signal(row: SqliteRow) -> Result<Signal> {
    let direction: String = row.get("direction");
    let breakdown_json: Option<String> = row.get("quality_breakdown");
    let breakdown = match breakdown_json {
        Some(json) => serde_json::from_str(&json).unwrap_or_default(),
        None => QualityBreakdown::default(),
    };
    Ok(Signal {
        id: row.get("id"),
        window_id: row.get("window_id"),
        direction: direction.parse()?,
        signal_ts: row.get("signal_ts"),
        confirm_ts: row.get("confirm_ts"),
        quality: row.get("quality"),
        breakdown,
        anchor_bar_ts: row.get("anchor_bar_ts"),
        created_at: row.get("created_at"),
    })
}

fn row_to_trade(row: SqliteRow) -> Result<Trade> {
    let status: String = row.get("status");
    let time_mode: Option<String> = row.get("time_mode");
    let policy_mode: String = row.get("policy_mode");
    let decision: String = row.get("decision");
    let cancel_reason: Option<String> = row.get("cancel_reason");
    let fill_status: String = row.get("fill_status");
    let fill_price: Option<String> = row.get("fill_price");
    let stake_amount: String = row.get("stake_amount");
    let pnl: Option<String> = row.get("pnl");
    let is_win: Option<i64> = row.get("is_win");

    Ok(Trade {
        id: row.get("id"),
        window_id: row.get("window_id"),
        signal_id: row.get("signal_id"),
        status: status.parse()?,
        time_mode: time_mode.map(|m| m.parse()).transpose()?,
        policy_mode: policy_mode.parse()?,
        decision: decision.parse()?,
        cancel_reason: cancel_reason.map(|r| r.parse()).transpose()?,
        token_id: row.get("token_id"),
        order_id: row.get("order_id"),
        fill_status: fill_status.parse()?,
        fill_price: fill_price.map(|p| Decimal::from_str(&p)).transpose()?,
        stake_amount: Decimal::from_str(&stake_amount)?,
        pnl: pnl.map(|p| Decimal::from_str(&p)).transpose()?,
        is_win: is_win.map(|v| v != 0),
        trade_level_streak: row.get("trade_level_streak"),
        night_streak: row.get("night_streak"),
        approval_emitted_ts: row.get("approval_emitted_ts"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_cap_check(row: SqliteRow) -> Result<CapCheck> {
    let status: String = row.get("status");
    let price_at_pass: Option<String> = row.get("price_at_pass");
    Ok(CapCheck {
        id: row.get("id"),
        trade_id: row.get("trade_id"),
        token_id: row.get("token_id"),
        confirm_ts: row.get("confirm_ts"),
        end_ts: row.get("end_ts"),
        status: status.parse()?,
        consecutive_ticks: row.get("consecutive_ticks"),
        first_pass_ts: row.get("first_pass_ts"),
        price_at_pass: price_at_pass.map(|p| Decimal::from_str(&p)).transpose()?,
        created_at: row.get("created_at"),
    })
}

fn row_to_stats(row: SqliteRow) -> Result<Stats> {
    let policy_mode: String = row.get("policy_mode");
    let is_paused: i64 = row.get("is_paused");
    let day_only: i64 = row.get("day_only");
    let night_only: i64 = row.get("night_only");
    Ok(Stats {
        trade_level_streak: row.get("trade_level_streak"),
        night_streak: row.get("night_streak"),
        policy_mode: policy_mode.parse()?,
        total_trades: row.get("total_trades"),
        total_wins: row.get("total_wins"),
        total_losses: row.get("total_losses"),
        last_strict_day_threshold: row.get("last_strict_day_threshold"),
        last_strict_night_threshold: row.get("last_strict_night_threshold"),
        last_quantile_update_ts: row.get("last_quantile_update_ts"),
        is_paused: is_paused != 0,
        day_only: day_only != 0,
        night_only: night_only != 0,
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    async fn seed_window(db: &Database) -> MarketWindow {
        db.insert_window("BTC", "btc-up-or-down-1", "cond-1", "tok-up", "tok-down", 1_000_000, 1_003_600)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.run_migrations().await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.policy_mode, PolicyMode::Base);
    }

    #[tokio::test]
    async fn window_slug_is_unique() {
        let db = test_db().await;
        seed_window(&db).await;
        let dup = db
            .insert_window("BTC", "btc-up-or-down-1", "cond-1", "a", "b", 1, 2)
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn one_signal_per_window() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let breakdown = QualityBreakdown::default();
        db.insert_signal(window.id, Direction::Up, 1_000_300, 1_000_420, 50.0, &breakdown, 1_000_000)
            .await
            .unwrap();
        let second = db
            .insert_signal(window.id, Direction::Down, 1_000_400, 1_000_520, 60.0, &breakdown, 1_000_000)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn one_non_terminal_trade_per_window() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let trade = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();
        assert_eq!(trade.status, TradeStatus::New);

        let dup = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await;
        assert!(dup.is_err());

        // Once terminal, a fresh trade may be created for the window.
        db.transition(
            trade.id,
            TradeStatus::Cancelled,
            TradeUpdate {
                cancel_reason: Some(CancelReason::Paused),
                decision: Some(Decision::AutoSkip),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn illegal_transition_is_refused_without_mutation() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let trade = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();

        let result = db
            .transition(trade.id, TradeStatus::Ready, TradeUpdate::default())
            .await;
        assert!(result.is_err());

        let reread = db.trade_by_id(trade.id).await.unwrap().unwrap();
        assert_eq!(reread.status, TradeStatus::New);
    }

    #[tokio::test]
    async fn terminal_trades_are_frozen() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let trade = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();
        db.transition(
            trade.id,
            TradeStatus::Cancelled,
            TradeUpdate {
                cancel_reason: Some(CancelReason::Expired),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        for target in [TradeStatus::SearchingSignal, TradeStatus::Settled, TradeStatus::Cancelled] {
            assert!(db
                .transition(trade.id, target, TradeUpdate::default())
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn settle_updates_trade_and_stats_together() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let trade = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();
        // Walk to ORDER_PLACED.
        db.transition(trade.id, TradeStatus::SearchingSignal, TradeUpdate::default())
            .await
            .unwrap();
        db.transition(trade.id, TradeStatus::Signalled, TradeUpdate::default())
            .await
            .unwrap();
        db.transition(trade.id, TradeStatus::WaitingConfirm, TradeUpdate::default())
            .await
            .unwrap();
        db.transition(trade.id, TradeStatus::WaitingCap, TradeUpdate::default())
            .await
            .unwrap();
        db.transition(trade.id, TradeStatus::Ready, TradeUpdate::default())
            .await
            .unwrap();
        db.transition(
            trade.id,
            TradeStatus::OrderPlaced,
            TradeUpdate {
                decision: Some(Decision::Ok),
                fill_status: Some(FillStatus::Filled),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut stats = db.stats().await.unwrap();
        stats.total_trades = 1;
        stats.total_wins = 1;
        stats.trade_level_streak = 1;

        let settled = db
            .settle_trade(trade.id, true, Decimal::new(818, 2), &stats)
            .await
            .unwrap();
        assert_eq!(settled.status, TradeStatus::Settled);
        assert_eq!(settled.is_win, Some(true));
        assert_eq!(settled.pnl, Some(Decimal::new(818, 2)));

        let stored = db.stats().await.unwrap();
        assert_eq!(stored.trade_level_streak, 1);
        assert_eq!(stored.total_wins, 1);
    }

    #[tokio::test]
    async fn cap_check_creation_is_idempotent() {
        let db = test_db().await;
        let window = seed_window(&db).await;
        let trade = db
            .create_trade(window.id, TimeMode::Day, PolicyMode::Base, 0, 0)
            .await
            .unwrap();

        let first = db
            .ensure_cap_check(trade.id, "tok-up", 1_000_420, 1_003_600, CapStatus::Pending)
            .await
            .unwrap();
        let second = db
            .ensure_cap_check(trade.id, "tok-up", 1_000_420, 1_003_600, CapStatus::Pending)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let db = test_db().await;
        db.set_setting("trading.price_cap", "0.52").await.unwrap();
        db.set_setting("trading.price_cap", "0.53").await.unwrap();
        assert_eq!(
            db.setting("trading.price_cap").await.unwrap().as_deref(),
            Some("0.53")
        );
        let all = db.all_settings().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}

//! MARTIN — trading assistant for hourly up/down prediction markets
//!
//! For each upcoming hourly window on a fixed set of assets the bot scans
//! live candles for a qualifying technical signal, validates the entry
//! price against a cap over consecutive book ticks, seeks human or policy
//! approval, places (or simulates) a flat-stake order, and records
//! settlement into a streak-driven policy engine.
//!
//! Two loops run concurrently: a snapshot worker keeping per-asset candle
//! context fresh, and the orchestrator advancing every live trade through
//! its lifecycle once per tick.

pub mod clients;
pub mod config;
pub mod db;
pub mod notifier;
pub mod services;
pub mod state_machine;
pub mod ta;
pub mod types;

pub use clients::{BinanceClient, ClobClient, GammaClient};
pub use config::{Config, ExecutionMode};
pub use db::Database;
pub use notifier::{decision_channel, DecisionSender, Notifier, NullNotifier, WebhookNotifier};
pub use services::{
    CapCheckService, ExecutionService, Orchestrator, SnapshotCache, SnapshotWorker, StatsService,
    TimeModeService,
};
pub use ta::{SignalOracle, TaEngine, TaSignal};

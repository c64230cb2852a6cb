//! `taskgate-store` – durable state for the kernel.
//!
//! All tables live in one SQLite database so that a task transition and the
//! receipt describing it commit in the same transaction.
//!
//! # Modules
//!
//! - [`database`] – [`Database`][database::Database]: owns the connection,
//!   applies the schema, and hands out `BEGIN IMMEDIATE` write transactions.
//! - [`task_store`] – [`TaskStore`][task_store::TaskStore]: task records and
//!   the conditional updates that move them through the state machine,
//!   including the optimistic `pending → claimed` claim.
//! - [`receipt_ledger`] – [`ReceiptLedger`][receipt_ledger::ReceiptLedger]:
//!   the append-only, per-client SHA-256 hash chain and its verifier.
//! - [`policy_store`] – [`PolicyStore`][policy_store::PolicyStore]:
//!   `client_id` + `task_type` approval rules; every change is receipted.
//!
//! Each module exposes free functions over a `&Connection` for composing
//! several writes inside one [`Database::write`][database::Database::write]
//! closure, plus a small struct facade for standalone calls.

pub mod database;
pub mod policy_store;
pub mod receipt_ledger;
pub mod task_store;

pub use database::{Database, StoreError};
pub use policy_store::PolicyStore;
pub use receipt_ledger::{GENESIS_HASH, NewReceipt, ReceiptLedger};
pub use task_store::TaskStore;

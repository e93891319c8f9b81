//! Naming service metrics.
//!
//! Registered in the default prometheus registry on first access.
//! Registration failures are fatal.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGaugeVec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec,
};

lazy_static! {
    /// Failed naming operations by operation, including deferred ones
    pub static ref NAMING_FAILURES: IntCounterVec = register_int_counter_vec!(
        "naming_operation_failures",
        "count of failed naming operations",
        &["operation"]
    ).unwrap();

    /// Failed operations parked in the retry ledger
    pub static ref NAMING_DEFERRED: IntCounterVec = register_int_counter_vec!(
        "naming_operations_deferred",
        "count of failed operations deferred to background retry",
        &["operation"]
    ).unwrap();

    /// Background retries that cleared their ledger entry
    pub static ref NAMING_RETRY_SUCCESS: IntCounterVec = register_int_counter_vec!(
        "naming_retry_success",
        "count of background retries that succeeded",
        &["operation"]
    ).unwrap();

    /// Ledger size after the latest retry tick
    pub static ref NAMING_LEDGER_PENDING: IntGaugeVec = register_int_gauge_vec!(
        "naming_ledger_pending",
        "pending retry ledger entries by kind",
        &["operation"]
    ).unwrap();

    /// Completed retry ticks
    pub static ref NAMING_RETRY_TICKS: IntCounter = register_int_counter!(
        "naming_retry_ticks",
        "count of completed background retry ticks"
    ).unwrap();

    /// Instance payloads that could not be decoded
    pub static ref NAMING_DECODE_FAILURES: IntCounter = register_int_counter!(
        "naming_decode_failures",
        "count of instance payloads skipped because they are not valid endpoints"
    ).unwrap();

    /// Membership notifications delivered to listeners
    pub static ref NAMING_NOTIFICATIONS: IntCounter = register_int_counter!(
        "naming_notifications",
        "count of listener notifications"
    ).unwrap();
}

//! Prometheus metrics for the swap portal, served on `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Gauge,
    IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref DEPOSITS_SEEN: IntCounterVec = register_int_counter_vec!(
        "portal_deposits_seen_total",
        "Deposits to the corporate address observed per chain",
        &["chain"]
    )
    .unwrap();

    pub static ref PAYOUTS: IntCounterVec = register_int_counter_vec!(
        "portal_payouts_total",
        "Disbursement attempts per destination chain and outcome",
        &["chain", "status"]
    )
    .unwrap();

    pub static ref INTENTS_ADMITTED: IntCounter = register_int_counter!(
        "portal_intents_admitted_total",
        "Intents accepted by the admission path"
    )
    .unwrap();

    pub static ref INTENTS_ABANDONED: IntCounter = register_int_counter!(
        "portal_intents_abandoned_total",
        "Intents closed without a matching deposit or swept by timeout"
    )
    .unwrap();

    pub static ref MATCH_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "portal_match_queue_depth",
        "Intents waiting in the deferred matcher queue"
    )
    .unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "portal_up",
        "Whether the portal is up and running"
    )
    .unwrap();
}

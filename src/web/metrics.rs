use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static SOURCE_TO_TARGET_RELAYED: AtomicU64 = AtomicU64::new(0);
static SOURCE_TO_TARGET_FAILED: AtomicU64 = AtomicU64::new(0);
static TARGET_TO_SOURCE_RELAYED: AtomicU64 = AtomicU64::new(0);
static TARGET_TO_SOURCE_FAILED: AtomicU64 = AtomicU64::new(0);
static ROOMS_PROVISIONED: AtomicU64 = AtomicU64::new(0);
static PUPPETS_PROVISIONED: AtomicU64 = AtomicU64::new(0);
static EVENTS_IGNORED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub source_to_target_relayed: u64,
    pub source_to_target_failed: u64,
    pub target_to_source_relayed: u64,
    pub target_to_source_failed: u64,
    pub rooms_provisioned: u64,
    pub puppets_provisioned: u64,
    pub events_ignored: u64,
}

pub struct Metrics;

impl Metrics {
    pub fn source_relayed() {
        SOURCE_TO_TARGET_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn source_failed() {
        SOURCE_TO_TARGET_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_relayed() {
        TARGET_TO_SOURCE_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_failed() {
        TARGET_TO_SOURCE_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_provisioned() {
        ROOMS_PROVISIONED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn puppet_provisioned() {
        PUPPETS_PROVISIONED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_ignored() {
        EVENTS_IGNORED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            source_to_target_relayed: SOURCE_TO_TARGET_RELAYED.load(Ordering::Relaxed),
            source_to_target_failed: SOURCE_TO_TARGET_FAILED.load(Ordering::Relaxed),
            target_to_source_relayed: TARGET_TO_SOURCE_RELAYED.load(Ordering::Relaxed),
            target_to_source_failed: TARGET_TO_SOURCE_FAILED.load(Ordering::Relaxed),
            rooms_provisioned: ROOMS_PROVISIONED.load(Ordering::Relaxed),
            puppets_provisioned: PUPPETS_PROVISIONED.load(Ordering::Relaxed),
            events_ignored: EVENTS_IGNORED.load(Ordering::Relaxed),
        }
    }
}

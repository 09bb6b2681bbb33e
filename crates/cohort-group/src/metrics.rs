//! Group membership metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is up to
//! the embedding process.

use metrics::{counter, gauge, histogram};

/// Metric names
pub mod names {
    pub const MEMBERS_JOINED_TOTAL: &str = "cohort_group_members_joined_total";
    pub const MEMBERS_LEFT_TOTAL: &str = "cohort_group_members_left_total";
    pub const MEMBERS_CURRENT: &str = "cohort_group_members";
    pub const HANDSHAKE_FAILURES_TOTAL: &str = "cohort_group_handshake_failures_total";
    pub const CONNECT_FAILURES_TOTAL: &str = "cohort_group_connect_failures_total";
    pub const ZAP_REQUESTS_SENT_TOTAL: &str = "cohort_group_zap_requests_sent_total";
    pub const ZAP_REQUESTS_RECEIVED_TOTAL: &str = "cohort_group_zap_requests_received_total";
    pub const MESSAGES_DROPPED_TOTAL: &str = "cohort_group_messages_dropped_total";
    pub const RESPONSE_WAIT_SECONDS: &str = "cohort_group_response_wait_seconds";
}

pub fn record_member_joined(current: usize) {
    counter!(names::MEMBERS_JOINED_TOTAL).increment(1);
    gauge!(names::MEMBERS_CURRENT).set(current as f64);
}

pub fn record_member_left(current: usize) {
    counter!(names::MEMBERS_LEFT_TOTAL).increment(1);
    gauge!(names::MEMBERS_CURRENT).set(current as f64);
}

pub fn record_handshake_failure() {
    counter!(names::HANDSHAKE_FAILURES_TOTAL).increment(1);
}

pub fn record_connect_failure(kind: &'static str) {
    counter!(names::CONNECT_FAILURES_TOTAL, "kind" => kind).increment(1);
}

pub fn record_zap_sent(code: i32) {
    counter!(names::ZAP_REQUESTS_SENT_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn record_zap_received(code: i32) {
    counter!(names::ZAP_REQUESTS_RECEIVED_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn record_message_dropped(kind: &str) {
    counter!(names::MESSAGES_DROPPED_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_response_wait(secs: f64) {
    histogram!(names::RESPONSE_WAIT_SECONDS).record(secs);
}

use bytes::Bytes;
use serde_json::json;

use ctxgate_common::{CostCaps, GatewayConfigPatch};
use ctxgate_core::build_state;
use ctxgate_cost::{Admission, CostDirection, CostTracker};
use ctxgate_protocol::{Envelope, WireShape};

fn state_with_caps(session_cap: f64) -> std::sync::Arc<ctxgate_core::GatewayState> {
    let patch = GatewayConfigPatch {
        session_cap_usd: Some(session_cap),
        ..GatewayConfigPatch::default()
    };
    let config = patch.into_config().unwrap();
    build_state(config).unwrap()
}

#[tokio::test]
async fn admission_denies_before_any_upstream_work() {
    let state = state_with_caps(0.01);
    assert_eq!(state.cost.admit(), Admission::Allowed);
    state.cost.record(
        "anthropic",
        "claude-sonnet-4-5",
        2000,
        500,
        5000,
        2000,
        CostDirection::Inference,
        false,
    );
    assert!(matches!(state.cost.admit(), Admission::Denied { .. }));
}

#[tokio::test]
async fn passthrough_pipes_leave_the_body_byte_identical() {
    let state = state_with_caps(0.0);
    let raw = serde_json::to_vec(&json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "messages": [
            { "role": "user", "content": "hello" },
            { "role": "assistant", "content": [
                { "type": "tool_use", "id": "tu_1", "name": "read_file", "input": { "path": "a" } }
            ]},
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "tu_1", "content": "data" }
            ]}
        ],
        "tools": [{ "name": "read_file", "description": "Read", "input_schema": {} }],
        "stream": true
    }))
    .unwrap();
    let original = Bytes::from(raw);
    let mut envelope = Envelope::parse(WireShape::Claude, original.clone()).unwrap();

    // Defaults are passthrough for both pipes.
    state.tool_discovery.apply(&mut envelope, "fp").await;
    state.tool_output.apply(&mut envelope).await;
    assert!(!envelope.is_dirty());
    assert_eq!(envelope.to_bytes(), original);
}

#[tokio::test]
async fn ledger_total_matches_counter_within_tolerance() {
    let tracker = CostTracker::new(CostCaps::default());
    for index in 0..50 {
        tracker.record(
            "anthropic",
            "claude-sonnet-4-5",
            1000 + index,
            200 + index,
            index * 10,
            index * 5,
            CostDirection::Inference,
            false,
        );
    }
    let ledger_sum: f64 = tracker.entries().iter().map(|entry| entry.cost_usd).sum();
    assert!((ledger_sum - tracker.session_total_usd()).abs() < 1e-4);
}

#[tokio::test]
async fn status_snapshot_reflects_recorded_cost() {
    let state = state_with_caps(0.0);
    state.cost.record(
        "openai",
        "gpt-5",
        1000,
        1000,
        0,
        0,
        CostDirection::Inference,
        false,
    );
    let snapshot = state.status.snapshot();
    assert!(snapshot.session_cost_usd > 0.0);
}

#![allow(clippy::unwrap_used, clippy::expect_used)]

use deckwright_core::{Confidence, JsonFailureKind};
use deckwright_repair::*;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn pipeline() -> RepairPipeline {
    RepairPipeline::default()
}

// ---------------------------------------------------------------------------
// 1. Valid JSON is returned untouched, with no layer attempted
// ---------------------------------------------------------------------------

#[test]
fn valid_json_bypasses_every_layer() {
    for text in [
        r#"{"a": 1, "b": [true, null]}"#,
        r#"[{"title": "x"}]"#,
        "  {\"nested\": {\"deep\": [1, 2, 3]}}\n",
    ] {
        let report = pipeline().recover(text, &ShapeHints::any());
        assert_eq!(report.outcome, RepairOutcome::Direct);
        assert!(report.attempted.is_empty());
        let expected: Value = serde_json::from_str(text).unwrap();
        assert_eq!(report.value, Some(expected));
    }
}

// ---------------------------------------------------------------------------
// 2. Garbage suffix: balanced prefix kept, junk discarded
// ---------------------------------------------------------------------------

#[test]
fn garbage_suffix_is_cut_at_the_balanced_prefix() {
    let text = r#"{"a":1,"b":2}, """#;
    let classification = pipeline().classify(text);
    assert_eq!(classification.kind, JsonFailureKind::GarbageSuffix);
    let end = classification.valid_prefix_end.unwrap();

    let report = pipeline().recover(text, &ShapeHints::object());
    assert_eq!(
        report.outcome,
        RepairOutcome::Repaired {
            layer: RepairLayer::PrefixExtraction
        }
    );
    let expected: Value = serde_json::from_str(&text[..end]).unwrap();
    assert_eq!(report.value, Some(expected));
    assert_eq!(report.value, Some(json!({"a": 1, "b": 2})));
}

#[test]
fn fenced_output_with_trailing_fence_is_recovered() {
    let report = pipeline().recover("{\"slides\": []}\n```\n", &ShapeHints::object());
    assert_eq!(report.value, Some(json!({"slides": []})));
}

// ---------------------------------------------------------------------------
// 3. Truncation: closed into well-formed JSON
// ---------------------------------------------------------------------------

#[test]
fn unterminated_string_and_object_are_closed() {
    let text = r#"{"a": "hello"#;
    assert_eq!(pipeline().classify(text).kind, JsonFailureKind::Truncation);

    let report = pipeline().recover(text, &ShapeHints::object());
    assert_eq!(
        report.outcome,
        RepairOutcome::Repaired {
            layer: RepairLayer::TruncationRepair
        }
    );
    assert_eq!(report.value, Some(json!({"a": "hello"})));
}

#[test]
fn truncation_repair_never_yields_invalid_json() {
    let samples = [
        r#"{"slides": [{"title": "One", "bullets": ["a", "b"#,
        r#"{"slides": [{"title": "One"}, {"title": "#,
        r#"{"a": 1, "b": {"c": [1, 2, {"d": "x\"#,
        r#"[{"k": "v"}, {"k": tr"#,
        r#"{"a": [1, 2, 3,"#,
        r#"{"k": "caf\u00e"#,
    ];
    for text in samples {
        let report = pipeline().recover(text, &ShapeHints::any());
        if let Some(value) = report.value {
            let reparsed: Value = serde_json::from_str(&value.to_string()).unwrap();
            assert_eq!(reparsed, value);
        }
    }
}

#[test]
fn truncated_list_keeps_completed_items() {
    let text = r#"{"slides": [{"title": "One"}, {"title": "Two"}, {"ti"#;
    let report = pipeline().recover(text, &ShapeHints::object_with_list("slides"));
    let value = report.value.unwrap();
    let slides = value["slides"].as_array().unwrap();
    assert_eq!(slides[0]["title"], "One");
    assert_eq!(slides[1]["title"], "Two");
}

// ---------------------------------------------------------------------------
// 4. String array where objects were expected
// ---------------------------------------------------------------------------

#[test]
fn string_array_is_wrapped() {
    let text = r#"["x","y","z"]"#;
    let report = pipeline().recover(text, &ShapeHints::object_array());
    assert_eq!(report.kind(), JsonFailureKind::StringArray);
    assert_eq!(
        report.outcome,
        RepairOutcome::Repaired {
            layer: RepairLayer::StringArrayWrap
        }
    );
    assert_eq!(
        report.value,
        Some(json!([{"type": "text", "content": ["x", "y", "z"]}]))
    );
}

#[test]
fn string_array_is_fine_when_no_objects_are_expected() {
    let report = pipeline().recover(r#"["x","y","z"]"#, &ShapeHints::any());
    assert_eq!(report.outcome, RepairOutcome::Direct);
}

// ---------------------------------------------------------------------------
// 5. Degeneration
// ---------------------------------------------------------------------------

#[test]
fn repeated_ab_is_degeneration_and_terminates_fast() {
    let text = "\"ab\"".repeat(2000);
    let start = Instant::now();

    let classification = pipeline().classify(&text);
    assert_eq!(classification.kind, JsonFailureKind::Degeneration);
    assert_eq!(classification.confidence, Confidence::High);

    let shape = ShapeHints::object_array();
    let report = pipeline().recover(&text, &shape);
    assert!(report.is_recovered());
    match report.outcome {
        RepairOutcome::Fallback { reason } => {
            assert_eq!(reason, FallbackReason::DegenerationExhausted);
            assert_eq!(report.value, Some(shape.fallback_value()));
        }
        RepairOutcome::Repaired { .. } => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn enum_concatenation_loop_is_salvaged() {
    let shape = ShapeHints::object_with_list("blocks").with_enum("type", ["text-block", "image"]);
    let text = r#"{"blocks": [{"type": "image", "src": "a.png"}, {"type": "text-blocktext-blocktext-blocktext-blocktext-blocktext-block"#;
    let report = pipeline().recover(text, &shape);
    assert_eq!(report.kind(), JsonFailureKind::Degeneration);
    assert_eq!(
        report.outcome,
        RepairOutcome::Repaired {
            layer: RepairLayer::DegenerationSalvage
        }
    );
    let value = report.value.unwrap();
    assert_eq!(value["blocks"][0]["type"], "image");
    assert_eq!(value["blocks"][1]["type"], "text-block");
}

#[test]
fn character_collapse_is_salvaged() {
    let text = format!(r#"{{"title": "Roadmap", "notes": "next{}"#, ".".repeat(300));
    let report = pipeline().recover(&text, &ShapeHints::object());
    assert_eq!(report.value, Some(json!({"title": "Roadmap", "notes": "next."})));
}

// ---------------------------------------------------------------------------
// 6. Size ceiling: constant-time fallback, no layer attempted
// ---------------------------------------------------------------------------

#[test]
fn oversized_text_returns_fallback_without_any_layer() {
    let text = format!(r#"{{"slides": [{}"#, r#"{"t": "x"},"#.repeat(2000));
    assert!(text.len() > DEFAULT_MAX_REPAIR_BYTES);

    let shape = ShapeHints::object_with_list("slides");
    let report = pipeline().recover(&text, &shape);
    assert_eq!(
        report.outcome,
        RepairOutcome::Fallback {
            reason: FallbackReason::Oversized
        }
    );
    assert!(report.attempted.is_empty());
    assert!(report.classification.is_none());
    assert_eq!(report.value, Some(json!({"slides": []})));
}

#[test]
fn size_ceiling_is_configurable() {
    let report = RepairPipeline::new(8).recover(r#"{"a": "hello"#, &ShapeHints::object());
    assert!(matches!(report.outcome, RepairOutcome::Fallback { .. }));
}

// ---------------------------------------------------------------------------
// 7. Idempotence
// ---------------------------------------------------------------------------

#[test]
fn repair_is_deterministic() {
    let inputs = [
        r#"{"a":1,"b":2}, """#.to_string(),
        r#"{"a": "hello"#.to_string(),
        r#"["x","y","z"]"#.to_string(),
        "\"ab\"".repeat(2000),
        r#"{"a": [1,, 2,], "#.to_string(),
    ];
    let shape = ShapeHints::object_array();
    for text in &inputs {
        let first = pipeline().recover(text, &shape);
        let second = pipeline().recover(text, &shape);
        assert_eq!(first, second);
    }
}

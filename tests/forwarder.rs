//! Forwarder Integration Tests
//!
//! Bridging bus events to sinks, and forwarder shutdown.

mod common;

use std::time::Duration;

use common::{stage, Delivery, ScriptedStage};
use revue::core::forwarder::TRACE_MESSAGE_TYPE;
use revue::core::{
    ChannelSink, EventBus, EventForwarder, Framing, Orchestrator, SequentialRoster, TraceMessage,
    WriterSink,
};
use revue::domain::{Phase, Progress, RunId, StageEvent, StageMeta, Telemetry};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

fn event(run_id: &RunId, phase: Phase) -> StageEvent {
    StageEvent::new(
        run_id.clone(),
        1,
        "Architect",
        phase,
        StageMeta::new(),
        Progress::new(1, 1),
        Telemetry::default(),
    )
}

#[tokio::test]
async fn test_forwards_run_until_finish() {
    let a = ScriptedStage::replying("Architect", "two words")
        .with_delivery(Delivery::Deltas)
        .arc();
    let roster = SequentialRoster::new(vec![stage(&a)]);

    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    bus.ensure_run(&run_id);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forwarder = EventForwarder::spawn(&bus, &run_id, ChannelSink::new(tx), Some("conv-7".into()));

    Orchestrator::new(bus.clone())
        .run_sequential_traced(&roster, "go", Some(run_id.clone()))
        .await
        .unwrap();
    bus.finish(&run_id);

    assert_eq!(forwarder.join().await, 4);

    let mut messages: Vec<TraceMessage> = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    let phases: Vec<Phase> = messages.iter().map(|m| m.event.phase).collect();
    assert_eq!(phases, vec![Phase::Start, Phase::Delta, Phase::Delta, Phase::End]);
    assert!(messages.iter().all(|m| m.kind == TRACE_MESSAGE_TYPE));
    assert!(messages
        .iter()
        .all(|m| m.conversation_id.as_deref() == Some("conv-7")));
}

#[tokio::test]
async fn test_subscribed_before_task_runs() {
    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let forwarder = EventForwarder::spawn(&bus, &run_id, ChannelSink::new(tx), None);
    // No yield between spawn and emit
    bus.emit(event(&run_id, Phase::Start));
    bus.finish(&run_id);

    assert_eq!(forwarder.join().await, 1);
    assert_eq!(rx.recv().await.unwrap().event.phase, Phase::Start);
}

#[tokio::test]
async fn test_sse_framing_over_writer() {
    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);

    let forwarder = EventForwarder::spawn(&bus, &run_id, WriterSink::new(writer, Framing::Sse), None);
    bus.emit(event(&run_id, Phase::Start));
    bus.emit(event(&run_id, Phase::End).with_summary("Architect completed"));
    bus.finish(&run_id);
    assert_eq!(forwarder.join().await, 2);

    let mut written = String::new();
    reader.read_to_string(&mut written).await.unwrap();

    let frames: Vec<&str> = written.split_terminator("\n\n").collect();
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        assert!(frame.starts_with("data: "));
    }
    let last: serde_json::Value = serde_json::from_str(&frames[1]["data: ".len()..]).unwrap();
    assert_eq!(last["type"], "trace_event");
    assert_eq!(last["phase"], "end");
    assert_eq!(last["summary"], "Architect completed");
    assert!(last["conversation_id"].is_null());
}

#[tokio::test]
async fn test_cancel_is_quiet_and_detaches() {
    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    bus.ensure_run(&run_id);
    let (tx, _rx) = mpsc::unbounded_channel();

    let forwarder = EventForwarder::spawn(&bus, &run_id, ChannelSink::new(tx), None);
    assert_eq!(bus.subscriber_count(&run_id), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    forwarder.cancel().await;

    assert_eq!(bus.subscriber_count(&run_id), 0);
}

#[tokio::test]
async fn test_drop_aborts_forwarding() {
    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    bus.ensure_run(&run_id);
    let (tx, _rx) = mpsc::unbounded_channel();

    let forwarder = EventForwarder::spawn(&bus, &run_id, ChannelSink::new(tx), None);
    drop(forwarder);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bus.subscriber_count(&run_id), 0);
}

#[tokio::test]
async fn test_closed_sink_stops_forwarding() {
    let bus = EventBus::default();
    let run_id = bus.new_run_id();
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);

    let forwarder = EventForwarder::spawn(&bus, &run_id, ChannelSink::new(tx), None);
    bus.emit(event(&run_id, Phase::Start));

    assert_eq!(forwarder.join().await, 0);
    assert_eq!(bus.subscriber_count(&run_id), 0);
}

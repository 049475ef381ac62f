use std::time::Duration;

use orchestra_core::event_bus::{Event, EventBus, EventEmitter, MemorySink};

#[tokio::test]
async fn events_emitted_before_listening_reach_the_sink_once_started() {
    let sink = MemorySink::new();
    let bus = EventBus::with_sink(sink.clone());
    bus.listen_for_events();

    let emitter = bus.get_emitter();
    emitter.emit(Event::step_message("checkpoint", "saved checkpoint_1")).expect("emit");

    // Sink delivery happens on a background task; give it a moment to run.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let snapshot = sink.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].message().contains("saved checkpoint_1"));

    bus.stop_listener().await;
}

#[tokio::test]
async fn multiple_sinks_all_receive_the_same_event() {
    let sink_a = MemorySink::new();
    let sink_b = MemorySink::new();
    let bus = EventBus::with_sinks(vec![Box::new(sink_a.clone()), Box::new(sink_b.clone())]);
    bus.listen_for_events();

    let emitter = bus.get_emitter();
    emitter.emit(Event::diagnostic("engine", "run completed")).expect("emit");

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(sink_a.snapshot().len(), 1);
    assert_eq!(sink_b.snapshot().len(), 1);

    bus.stop_listener().await;
}

#[tokio::test]
async fn subscribe_observes_events_emitted_after_subscription() {
    let bus = EventBus::with_sink(MemorySink::new());
    let mut stream = bus.subscribe();

    let emitter = bus.get_emitter();
    emitter.emit(Event::step_message("fetch", "started")).expect("emit");

    let received = stream.recv().await.expect("an event should arrive");
    assert!(received.message().contains("started"));
}

#[tokio::test]
async fn add_sink_after_listening_starts_receiving_immediately() {
    let bus = EventBus::with_sink(MemorySink::new());
    bus.listen_for_events();

    let late_sink = MemorySink::new();
    bus.add_sink(late_sink.clone());

    let emitter = bus.get_emitter();
    emitter.emit(Event::step_message("late", "arrived after sink added")).expect("emit");

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(late_sink.snapshot().len(), 1);

    bus.stop_listener().await;
}

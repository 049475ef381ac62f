//! Event bus utilities providing fan-out, sinks, and subscriber APIs.
//!
//! The module is organised around a broadcast-based [`EventHub`] and helpers for
//! configuring sinks (`EventBus`) and consuming the resulting [`EventStream`]).
//! The [`Engine`](crate::engine::Engine) publishes a [`ProgressEvent`] for every
//! status transition of a run; [`progress::into_event`] lowers that into the
//! generic [`Event`] wire format sinks understand.

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod progress;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{EmitterError, EventEmitter};
pub use event::{Event, LLMStreamingEvent, STREAM_END_SCOPE, StepEvent};
pub use hub::{BlockingEventIter, EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use progress::ProgressEvent;
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};

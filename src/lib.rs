//! Event-driven runtime over partitioned Redis logs.
//!
//! Events are appended to per-partition logs by a [`Producer`], read in
//! order by one [`Consumer`] per partition, and handed through a fairness
//! [`Scheduler`] to a pool of [`Processor`]s that run handlers locally or
//! proxy them to an HTTP, gRPC, or Lambda target. [`EdaRuntime`] wires it
//! together from a builder.

mod auth;
mod broker;
mod codec;
mod config;
mod consumer;
mod dead_letter;
mod error;
mod event;
mod monitor;
mod partition;
mod processor;
mod producer;
mod publisher;
mod registration;
mod runtime;
mod scheduler;
mod store;
mod topic;
mod tracked;

/// Generated types for the `eda.processor.v1` gRPC contract.
pub mod proto {
    tonic::include_proto!("eda.processor.v1");
}

pub use auth::BearerToken;
pub use broker::{Broker, EventRouter};
pub use codec::{decode_batch, encode_batch};
pub use config::{ConsumerConfig, MonitorConfig, ProducerConfig, ProxyConfig, RetryPolicy};
pub use consumer::{Consumer, ConsumerState};
pub use dead_letter::{DeadLetterEntry, read_dead_letters};
pub use error::{
    CodecError, ConfigError, PollError, ProcessError, ProduceError, RouteError, StoreError,
};
pub use event::{
    CLEAR_TRACKED_KEYS_EVENT, EventEnvelope, OBSERVER_NOTIFICATION_EVENT, Observable,
    ObserverNotification, RoutedEvent, observer_key,
};
pub use monitor::Monitor;
pub use partition::{PartitionMapper, default_mapper, map_to_partition};
pub use processor::{
    EventProcessor, GrpcProcessor, HttpProcessor, LambdaProcessor, LocalProcessor, Processor,
    RemoteFailure, RemoteRequest, RemoteResponse,
};
pub use producer::Producer;
pub use publisher::{Observation, Publisher, observers_key};
pub use registration::{
    EventHandler, HandlerError, HandlerFactory, HandlerRegistry, HandlerRegistryBuilder,
    HandlerScope, Registration, RegistrationKey,
};
pub use runtime::{EdaRuntime, EdaRuntimeBuilder, ProcessorKind};
pub use scheduler::{Completion, DEFAULT_SWEEP_INTERVAL, Scheduler, SchedulerStats, WorkItem};
pub use store::{ChangeFeed, ChangeStream, LogStore, MemoryLogStore, RedisLogStore};
pub use topic::{PartitionAffinity, PartitionKeys, Topic, TopicBuilder};
pub use tracked::TrackedIds;

#![doc = include_str!("../README.md")]

pub use chronicle_core::{
    aggregate,
    aggregate::{Aggregate, AggregateContext, AggregateFactory, DomainError, EventLog},
    command,
    command::{AggregateCommandHandler, CommandBus, CommandError, CommandHandler, SendOptions},
    message,
    message::{Command, Event, EventStream, Id, Message, SNAPSHOT_KIND},
    projection,
    projection::{Projection, ProjectionRuntime, ProjectionView, ViewError},
    saga,
    saga::{Saga, SagaContext, SagaEventHandler, SagaFactory, SagaLog},
    snapshot::SnapshotStorage,
    store::{CommitError, EventStore, StoreError, ValidationError},
    subscription,
    subscription::{filter, OnceSubscription},
};

pub mod bus {
    pub use chronicle_core::bus::{handler, inmemory, BusError, Handler, MessageBus};
}

pub mod storage {
    pub use chronicle_core::{
        snapshot::inmemory as snapshot_inmemory,
        storage::{inmemory, EventStorage, StorageError},
    };
}

//! Core traits and runtime for the Chronicle event-sourcing library.
//!
//! This crate provides the building blocks of an event-sourced system:
//!
//! - [`message`] - The shared command/event shape (`Message`, `Id`)
//! - [`storage`] - Durable event log abstraction (`EventStorage`)
//! - [`snapshot`] - Latest-snapshot-per-aggregate abstraction (`SnapshotStorage`)
//! - [`bus`] - Publish/subscribe transport (`MessageBus`), with named queues
//! - [`store`] - Atomic commit-then-publish coordination (`EventStore`)
//! - [`subscription`] - One-time filtered subscriptions (`OnceSubscription`)
//! - [`aggregate`] - Command-side contract (`Aggregate`, `EventLog`)
//! - [`command`] - Command routing and execution (`CommandBus`,
//!   `AggregateCommandHandler`)
//! - [`saga`] - Event-driven processes (`Saga`, `SagaEventHandler`)
//! - [`projection`] - Read models (`Projection`, `ProjectionView`,
//!   `ProjectionRuntime`)
//!
//! Most users should depend on the `chronicle` crate, which re-exports these
//! types with a cleaner API surface.

pub mod aggregate;
pub mod bus;
pub mod command;
pub mod message;
pub mod projection;
pub mod saga;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod subscription;

// /////////////////////////////////////////////////////////////////////////////
// Experiment Runner
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Experiment Runner Domain Layer
//!
//! Pure domain types for the experiment runner: the request envelope pulled
//! off a message queue, the artifact references it carries, the resource
//! tuple the scheduler matches against local hardware, and the lifecycle
//! states that gate new-work pickup.
//!
//! ## Overview
//!
//! This crate holds everything the application and infrastructure layers
//! agree on but that owns no I/O of its own:
//!
//! - **Entities**: `Request`, `Experiment`, `Artifact` - the typed form of a
//!   queue message and the storage objects it references
//! - **Value Objects**: `Resource` with its field-wise `fits` ordering,
//!   `LifecycleState` for drain coordination
//! - **Ports**: `StorageService` and `QueueService`, the async traits the
//!   infrastructure backends implement
//! - **Errors**: `RunnerError`, the single error enum that crosses layer
//!   boundaries as a value, never as a panic
//!
//! ## Layering
//!
//! Dependencies point inward: infrastructure implements the ports defined
//! here, the application layer consumes both, and nothing in this crate
//! performs network or filesystem I/O. The async port traits are the one
//! concession to the outside world; they stay here so the dispatcher can be
//! written purely against interfaces.

pub mod entities;
pub mod error;
pub mod services;
pub mod value_objects;

// Re-export commonly used types for convenient access
pub use entities::artifact::{Artifact, StorageScheme};
pub use entities::request::{Experiment, Request, RequestConfig};
pub use error::{ResourceDimension, RunnerError};
pub use services::queue::{HandlerVerdict, QueueService, TaskHandler, WorkOutcome};
pub use services::storage::StorageService;
pub use value_objects::lifecycle::LifecycleState;
pub use value_objects::resource::Resource;

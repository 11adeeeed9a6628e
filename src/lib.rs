//! # courierd
//!
//! **courierd** is a host-resident connector daemon. It bridges a remote
//! control/data plane and a set of locally-installed worker subprocesses:
//! inbound payloads are routed to the worker that claims their directive,
//! worker responses are republished upstream, and the set of live workers
//! is advertised to the control plane whenever it changes.
//!
//! ## Components
//!
//! | Area               | Description                                                      | Key types                                    |
//! |--------------------|------------------------------------------------------------------|----------------------------------------------|
//! | **Supervision**    | Spawn, reap and restart worker executables with capped backoff.  | [`ProcessSupervisor`], [`BackoffStrategy`]   |
//! | **Registry**       | Single-writer map from directive to live worker.                 | [`RegistryHandle`], [`WorkerRecord`]         |
//! | **Dispatch**       | Per-handler ordered routing between transport and workers.       | [`Dispatcher`]                               |
//! | **Local RPC**      | UNIX-socket RPC surface for workers.                             | [`RpcServer`], [`RpcListener`]               |
//! | **Advertisement**  | Hash-deduped connection-status publishing.                       | [`Advertiser`]                               |
//! | **Control plane**  | ping/disconnect/reconnect command handling.                      | [`ControlHandler`]                           |
//! | **Transport**      | Abstract remote pub/sub endpoint.                                | [`Transport`], [`HttpPollTransport`]         |
//! | **Lifecycle**      | Wiring, signals, guaranteed teardown.                            | [`Daemon`]                                   |
//! | **Errors**         | Typed errors for the runtime and the dispatch path.              | [`RuntimeError`], [`DispatchError`]          |
//!
//! The daemon binary lives in `main.rs`; everything here is a library so
//! the components stay testable in-process.

pub mod advertiser;
pub mod alive;
pub mod bus;
pub mod config;
pub mod control;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod observer;
pub mod os_signals;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod strategy;
pub mod telemetry;
pub mod transport;
pub mod watcher;

// ---- Public re-exports ----

pub use advertiser::Advertiser;
pub use config::{ClientIdSource, Config, TransportKind};
pub use control::ControlHandler;
pub use daemon::Daemon;
pub use dispatcher::{Dispatcher, DispatcherQueues};
pub use error::{DispatchError, RuntimeError};
pub use event::{Event, EventKind};
pub use message::{Command, ConnectionStatus, Data, DispatchersMap, EventMessage};
pub use observer::{LoggerObserver, Observer};
pub use process::{ProcessState, ProcessSupervisor, WorkerDied};
pub use registry::{RegistryHandle, WorkerRecord};
pub use rpc::{RpcListener, RpcServer};
pub use strategy::BackoffStrategy;
pub use transport::{HttpPollTransport, Transport};

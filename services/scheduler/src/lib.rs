//! flotilla scheduler
//!
//! The central process of the scheduling domain. Operators declare jobs
//! against the public API; the registry stores the desired state; the
//! transformer drives the agent fleet toward it and reports every outcome
//! back as a signal.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler           (public Schedule/Migrate/Unschedule, placement)
//!    │ intents + acks
//! Registry            (pending-schedule / scheduled / pending-unschedule)
//!    │ snapshots            ▲ signals
//! Transformer          ─────┘
//! ├── StateMachine(endpoint)   (live view of one agent via its event stream)
//! └── RemoteAgent(endpoint)    (typed REST client)
//! ```
//!
//! Each long-lived component is a runloop owning its state; the registry is
//! the one mutex-guarded record, and nothing holds it across an await.

pub mod algorithms;
pub mod api;
pub mod config;
pub mod discovery;
pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod state_machine;
pub mod transformer;

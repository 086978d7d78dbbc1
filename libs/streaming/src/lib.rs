//! # Streaming
//!
//! ## Purpose
//!
//! Credit-based streams between actors. A source may only send as many
//! elements as its sink granted; every stream is a chain of stages, each
//! holding its paths and their lifecycle.
//!
//! ## Architecture Role
//!
//! ```text
//!              ┌────────────────────── StageGraph ─────────────────────┐
//!  frames ──►  │ Stage(sid)                                            │
//!  (codec)     │   upstream Path ──InboundCredit──► elements to owner  │
//!              │   downstream Paths ──OutboundCredit──► batches        │
//!              └───────────────────────────────────────────────────────┘
//!                        ▲ StreamApplication (network::Application)
//! ```
//!
//! - [`credit`]: source and sink sides of flow control
//! - [`path`]: per-peer state machine
//! - [`graph`]: stages, message dispatch, close and failure handling
//! - [`application`]: the graph as an endpoint application
//!
//! ## Path Lifecycle
//!
//! ```text
//! Pending ─open─► Open ─ok─► Active ─close()─► Closing ─drained─► Closed
//!                             │  ▲
//!                    failed   ▼  │ resume / re-open
//!                            Failed ──grace expired──► Closed (abort)
//! ```

pub mod application;
pub mod credit;
pub mod element;
pub mod error;
pub mod event;
pub mod graph;
pub mod path;

pub use application::StreamApplication;
pub use credit::{AckOutcome, InboundCredit, OutboundCredit};
pub use element::StreamElement;
pub use error::{Result, StreamError};
pub use event::StreamEvent;
pub use graph::{OpenRequest, Outgoing, Stage, StageGraph};
pub use path::{Direction, Path, PathState};

//! Batching and delivery channel for client-side telemetry
//!
//! Telemetry recorded through a [`TelemetryClient`] flows through a fixed
//! pipeline:
//!
//! 1. enrichment with context ids and deterministic sampling ([`Enricher`])
//! 2. a send buffer, volatile or mirrored into [`Storage`] ([`SendBuffer`])
//! 3. a scheduler flushing on a timer, on size and on demand ([`Sender`])
//! 4. transmission through the best available [`Transport`], with
//!    retry classification and exponential backoff
//!
//! Statistics and self-diagnostics are collected along the way.
//!
//! ```no_run
//! use telemetry_channel::{ChannelConfig, TelemetryClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TelemetryClient::builder()
//!     .config(
//!         ChannelConfig::builder()
//!             .instrumentation_key("00000000-0000-0000-0000-000000000000")
//!             .sampling_percentage(50.0)
//!             .build(),
//!     )
//!     .build()?;
//!
//! client.track_event("checkout");
//! client.track_metric("cart_size", 3.0);
//!
//! // Before the process goes away
//! client.unload().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod data_loss;
pub mod diagnostics;
pub mod enrichment;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod retry;
pub mod sampling;
pub mod sender;
pub mod stats;
pub mod storage;
pub mod transport;

pub use buffer::{ArraySendBuffer, Batch, BatchFormat, BufferItem, PersistedSendBuffer, SendBuffer};
pub use client::TelemetryClient;
pub use config::{ChannelConfig, StatsBeatConfig};
pub use connectivity::{ConnectivityHost, ConnectivityState, ManualConnectivity, OfflineListener};
pub use context::{ContextProvider, NoContext, StaticContext};
pub use data_loss::DataLossAnalyzer;
pub use diagnostics::{DiagnosticLogger, InternalMessage, MessageId, PipelineContext};
pub use enrichment::Enricher;
pub use envelope::{SeverityLevel, TelemetryEnvelope, TelemetryItem, TelemetryKind};
pub use error::{Error, ItemError, Result};
pub use queue::PreInitQueue;
pub use retry::{BackoffState, RetryPolicy};
pub use sampling::Sampler;
pub use sender::{FlushReport, FlushTrigger, Sender};
pub use stats::{EndpointSnapshot, Statistics};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::{HttpTransport, Transport, TransportKind, TransportPolicy};

//! Background sampling of the current process's own network connections.
//!
//! Each new (local, remote, status) triple seen during a session becomes one
//! [`ConnectionRecord`], classified by remote port and checked against a
//! watch list. Readers get copies via [`SamplerSnapshot`].

pub mod classify;
pub mod model;
pub mod rdns;
pub mod sampler;
pub mod session;
pub mod source;

pub use classify::Classifier;
pub use model::{Category, ConnStatus, ConnectionRecord, MonitorStats, Protocol, RawConnection, SamplerSnapshot};
pub use sampler::{ConnectionSampler, SamplerConfig};
pub use source::{ConnectionSource, ProcNetSource, SourceError};

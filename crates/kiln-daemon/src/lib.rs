//! Build coordinator for the kiln compile cache.
//!
//! A request enters through [`Dispatcher::dispatch`], gets fingerprinted,
//! checked against the artifact store, and on a miss is collapsed with
//! concurrent identical requests through the inflight table. The winning
//! leader runs the build on the bounded worker pool, via the local compiler
//! subprocess or a remote builder, and writes the result back into the store
//! before waking every waiter.

pub mod artifact;
pub mod backend;
pub mod cancel;
pub mod dispatcher;
pub mod error;
pub mod inflight;
pub mod local;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod stats;
pub mod workers;

pub use backend::{BackendError, BackendKind, BuildJob, BuildOutput, CompileBackend};
pub use cancel::CancelToken;
pub use dispatcher::{CompileReply, CompileRequest, Context, Dispatcher, Served};
pub use error::{DispatchError, DispatchResult};
pub use inflight::{Claim, FollowerSignal, InflightTable, LeaderSlot};
pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use server::Server;
pub use stats::{DispatchStats, StatsSnapshot};
pub use workers::WorkerPool;

//! Job orchestration for Gantry: run creation, job status resolution,
//! matrix expansion, reusable workflow calls, concurrency control, task
//! dispatch and trust decisions.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod emitter;
pub mod expander;
pub mod graph;
pub mod notify;
pub mod parser;
pub mod queue;
pub mod rerun;
pub mod resolver;
pub mod runs;
pub mod token;
pub mod trust;
pub mod workflow_call;

pub use concurrency::ConcurrencySpec;
pub use config::{LogCompression, SchedulerConfig};
pub use dispatcher::{AssignedTask, TaskDispatcher};
pub use emitter::JobEmitter;
pub use expander::{Expansion, MatrixExpander};
pub use notify::{CommitStatusReporter, TracingSink};
pub use parser::MatrixParser;
pub use resolver::JobStatusResolver;
pub use runs::RunService;
pub use trust::TrustGate;
pub use workflow_call::TaskNeed;

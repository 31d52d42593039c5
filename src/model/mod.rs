//! Data model shared by the runner, the control-plane mock and scenario files.

mod job;
mod message;
mod scenario;

pub use job::{
    Advisory, Allowed, CASE_INSENSITIVE_EXPERIMENT, CommitOptions, Condition, Credential,
    DEPENDENCY_GRAPH_EXPERIMENT, ExistingPr, Experiments, Group, Job, JobCommand, Object,
    SECRET_FIELDS, Source,
};
pub use message::{
    ClosePullRequest, CreatePullRequest, Dependency, DependencyFile, Envelope, IncrementMetric,
    MarkAsProcessed, Message, MessageKind, RecordEcosystemVersions, RecordUpdateJobError,
    Requirement, UpdateDependencyList, UpdatePullRequest,
};
pub use scenario::{Input, Scenario, parse_document};

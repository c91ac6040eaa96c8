pub mod ensemble;
pub mod service;
pub mod stream;
pub mod types;

pub use ensemble::Ensemble;
pub use service::{Orchestrator, OrchestratorSettings, ProviderStatus};
pub use stream::FragmentStream;
pub use types::{
    CandidateScore, CompletionRequest, CompletionResponse, ContextFile, EnsembleMetadata,
    RequestContext,
};

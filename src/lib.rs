pub mod collector;
pub mod config;
pub mod dedup;
pub mod generation;
pub mod pipeline;
pub mod prompts;
pub mod publisher;
pub mod scheduler;
pub mod selector;
pub mod sources;
pub mod store;
pub mod types;

pub use collector::Collector;
pub use config::{Config, QuotaPolicy, RunMode};
pub use dedup::{ConceptHistoryWindow, DedupChecker};
pub use generation::{DraftOutcome, GenerationPipeline, MockGenerator, MockReply, TextGenerator};
pub use pipeline::{BotPipeline, CycleReport, Stage};
pub use publisher::{HttpSink, LogSink, PostSink, Publisher};
pub use scheduler::Scheduler;
pub use selector::{CandidateSelector, ContentMix};
pub use sources::nvd::NvdClient;
pub use sources::VulnFeed;
pub use store::Store;
pub use types::*;

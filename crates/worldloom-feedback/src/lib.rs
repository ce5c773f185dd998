//! Worldloom Feedback - background critique of an authoring session
//!
//! Every model call the host makes is recorded in a call ledger. Finished
//! calls are classified and queued for critique; critique is folded into five
//! persistent memory documents that later prompts can draw on.

pub mod config;
pub mod engine;
pub mod ledger;
pub mod memory;
pub mod prompt;
pub mod provider;
pub mod queue;
pub mod storage;

pub use config::FeedbackConfig;
pub use engine::{FeedbackEngine, LedgerListener, SubscriptionId};
pub use ledger::{CallLedger, FeedbackRequest};
pub use memory::{DocumentId, MemoryDocuments, MemorySnapshot};
pub use provider::{EntitySource, FeedbackGenerator, GeneratorError, GeneratorResult, MessageSink, NoEntities, NullSink};
pub use queue::{ConcurrencyClass, Coordinator, CoordinatorEvent, TaskRunner};
pub use storage::{FileSlot, InMemorySlot, KvSlot};

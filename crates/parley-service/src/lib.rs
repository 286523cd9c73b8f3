pub mod conversations;
pub mod error;
pub mod orchestrator;

pub use conversations::{ConversationService, EscalationSource};
pub use error::ServiceError;
pub use orchestrator::{AiOrchestrator, AiTurnOutcome};

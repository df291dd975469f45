//! The chat gateway: provider abstraction, prompt variants, and the
//! dispatch path behind the OpenAI-compatible surface.

mod canned;
mod dispatch;
mod provider;
mod registry;
mod tokenizer;
mod upstream;
mod variants;

pub use canned::CannedProvider;
pub use dispatch::{
    ChatCompletion, DispatchResult, Dispatcher, Usage, classify_spectrum,
};
pub use provider::{ChatMessage, ChatRequest, FinishReason, Provider, ProviderResponse, Role};
pub use registry::{ModelInfo, ProviderRegistry};
pub use tokenizer::{estimate_message_tokens, estimate_text_tokens};
pub use upstream::OpenAiUpstream;
pub use variants::{
    PromptVariant, VariantAction, VariantChange, VariantParameters, VariantStatus, VariantStore,
};

//! Dialect transformers: pure functions translating a validated request
//! from the client's `APIFormat` into whatever dialect the resolved
//! `LLMService` actually speaks, and translating that service's response
//! back into the client's original dialect.
//!
//! Each direction is a small, independently testable pure function, the
//! same shape as the teacher's `llm::conversion::completions::translate`
//! (take a typed request, build a typed request in the target dialect) —
//! generalized here to also cover Anthropic, Google AI, and Mistral rather
//! than just the OpenAI completions-to-chat upgrade the teacher handles.

pub mod request;
pub mod response;

pub use request::translate_request;
pub use response::translate_response;

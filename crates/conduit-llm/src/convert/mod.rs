//! Conversion between the neutral conversation model and wire formats
//!
//! Each submodule builds one provider's request body and decodes its stream
//! chunks into [`StreamEvent`](crate::types::StreamEvent)s.

pub mod google;
pub mod ollama;
pub mod openai;

//! Provider wire formats

pub mod google;
pub mod ollama;
pub mod openai;

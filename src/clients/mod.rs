//! Clients for the external model services.

pub mod gateway;
pub mod openai;

pub use gateway::GatewayClient;
pub use openai::OpenAIEmbedder;

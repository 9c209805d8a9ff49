use thiserror::Error;

/// Failure talking to, or decoding a response from, a chain endpoint.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid address `{0}`")]
    Address(String),

    #[error("Chain registry error: {0}")]
    Registry(String),
}

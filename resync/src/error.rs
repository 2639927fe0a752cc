use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Discovery failures are fatal; no trigger has been sent yet.
    #[error("cannot enumerate externalsecrets: {0}")]
    Discovery(#[source] kube::Error),

    #[error("externalsecret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("report serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

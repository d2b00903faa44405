/// Errors produced while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid message frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet compression failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("compressed packet data without a packet header")]
    OrphanPacketData,
}

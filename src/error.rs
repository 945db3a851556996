use std::io;

use thiserror::Error;

/// Failures that terminate a single proxied connection.
///
/// Nothing here ever crosses a connection boundary; the handler maps each
/// variant to a silent drop or a fixed error response and moves on.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client closed or stalled before a full header section arrived.
    #[error("connection closed before end of headers")]
    ConnectionClosed,

    /// The header section outgrew the framing cap.
    #[error("request header section too large")]
    HeaderTooLarge,

    /// Resolving or connecting to the origin failed.
    #[error("failed to reach upstream {host}:{port}")]
    UpstreamUnreachable {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },
}

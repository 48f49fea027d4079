use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const SECRET_LEN: usize = 4;

pub type Secret = [u8; SECRET_LEN];

/// The secrets a rendezvous server issued for one connection attempt: our own, which we present
///  on every candidate connection, and the one we expect the peer to present.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SecretPair {
    pub own: Secret,
    pub expected: Secret,
}

/// Performs the secret exchange on a freshly established candidate connection. Returns `true`
///  if the peer presented the expected secret.
///
/// A mismatch or I/O error is not an error of the connection attempt as a whole: the candidate
///  is discarded, and other candidates may still succeed.
pub async fn authenticate_candidate(stream: &mut (impl AsyncRead + AsyncWrite + Unpin), secrets: &SecretPair) -> bool {
    match exchange(stream, secrets).await {
        Ok(true) => true,
        Ok(false) => {
            debug!("candidate presented a wrong secret - discarding");
            false
        }
        Err(e) => {
            debug!("I/O error during secret exchange - discarding candidate: {}", e);
            false
        }
    }
}

async fn exchange(stream: &mut (impl AsyncRead + AsyncWrite + Unpin), secrets: &SecretPair) -> std::io::Result<bool> {
    stream.write_all(&secrets.own).await?;
    stream.flush().await?;

    let mut received = [0u8; SECRET_LEN];
    stream.read_exact(&mut received).await?;
    Ok(received == secrets.expected)
}

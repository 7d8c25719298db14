//! Anonymous TLS between SSL-capable IP peers.
//!
//! Negotiated only when both sides advertise NODE_SSL: anonymous ECDH on
//! `secp256k1` with the `AECDH-AES256-SHA` suite, no certificates, no
//! hostname checks. The handshake runs over the already non-blocking
//! socket, retrying on readiness.

use std::net::TcpStream;
use std::time::Duration;

use openssl::ec::EcKey;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
    SslVerifyMode, SslVersion,
};
use tracing::debug;

use crate::error::DisconnectReason;

const CIPHER_LIST: &str = "AECDH-AES256-SHA";

/// Give up on a handshake that makes no progress for this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between handshake attempts while the socket is not ready.
const RETRY_DELAY: Duration = Duration::from_millis(100);

fn context() -> Result<SslContext, ErrorStack> {
    let mut builder = SslContextBuilder::new(SslMethod::tls())?;
    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    // Anonymous suites exist only up to TLS 1.2, and sit below every
    // modern security level.
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_security_level(0);
    builder.set_cipher_list(CIPHER_LIST)?;
    builder.set_verify(SslVerifyMode::NONE);
    let curve = EcKey::from_curve_name(Nid::SECP256K1)?;
    builder.set_tmp_ecdh(&curve)?;
    Ok(builder.build())
}

/// Upgrade a connected socket to TLS, driving the handshake
/// non-blockingly. The server side accepts, the client side connects.
pub async fn upgrade(
    stream: TcpStream,
    server: bool,
) -> Result<SslStream<TcpStream>, DisconnectReason> {
    let context = context().map_err(|e| DisconnectReason::Tls(e.to_string()))?;
    let ssl = Ssl::new(&context).map_err(|e| DisconnectReason::Tls(e.to_string()))?;

    let started = std::time::Instant::now();
    let mut attempt = if server {
        ssl.accept(stream)
    } else {
        ssl.connect(stream)
    };
    loop {
        match attempt {
            Ok(stream) => {
                debug!(target: "p2p", "TLS negotiated with {:?}", stream.get_ref().peer_addr());
                return Ok(stream);
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                if started.elapsed() > HANDSHAKE_TIMEOUT {
                    return Err(DisconnectReason::Tls("handshake timed out".into()));
                }
                tokio::time::sleep(RETRY_DELAY).await;
                attempt = mid.handshake();
            }
            Err(err) => return Err(DisconnectReason::Tls(err.to_string())),
        }
    }
}

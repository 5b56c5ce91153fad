//! The pre-framing handshake: greeting line, signed authorization line,
//! single-line server verdict.
//!
//! The plain-text phase lets the server route the connection to the right
//! realm before any binary protocol is committed to; only after an `OK`
//! verdict does the session switch framing on.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::config::LocalConf;
use crate::error::AgentError;
use crate::messages::{AuthRequest, AuthResponse, CONNECT_GREETING};

/// Fixed path the OAuth string is signed against.
pub const AUTHORIZE_PATH: &str = "/secure-data-connector/authorize";

const OAUTH_SIGNATURE_METHOD: &str = "HMAC-SHA256";
const OAUTH_VERSION: &str = "1.0";

/// Longest acceptable handshake response line.
const MAX_RESPONSE_LINE: usize = 16 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Builds the signed [`AuthRequest`] for this session: fresh timestamp,
/// fresh CSPRNG nonce.
pub fn build_auth_request(conf: &LocalConf) -> Result<AuthRequest, AgentError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut nonce_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut nonce_bytes);
    let oauth_string = signed_oauth_string(conf, timestamp, &hex::encode(nonce_bytes))?;
    Ok(AuthRequest { oauth_string })
}

/// Produces the canonical signed query string
/// `URL?params&oauth_signature=…` for the given timestamp and nonce.
///
/// Parameters are percent-encoded and lexicographically ordered before
/// signing, OAuth 1.0 style; the signing key is the percent-encoded
/// consumer secret followed by `&`.
pub fn signed_oauth_string(
    conf: &LocalConf,
    timestamp: u64,
    nonce: &str,
) -> Result<String, AgentError> {
    let url = format!("https://{}{}", conf.tunnel_host()?, AUTHORIZE_PATH);
    let timestamp = timestamp.to_string();
    let email = conf.email();
    let mut params = vec![
        ("oauth_consumer_key", conf.domain.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", OAUTH_SIGNATURE_METHOD),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_version", OAUTH_VERSION),
        ("requestor_id", email.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect::<Vec<_>>();
    params.sort();

    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "GET&{}&{}",
        percent_encode(&url),
        percent_encode(&param_string)
    );
    let signing_key = format!("{}&", percent_encode(&conf.oauth_consumer_secret));

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| AgentError::Config(format!("oauth signer init: {e}")))?;
    mac.update(base_string.as_bytes());
    let signature = base64_encode(&mac.finalize().into_bytes());

    Ok(format!(
        "{url}?{param_string}&oauth_signature={}",
        percent_encode(&signature)
    ))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

/// RFC 3986 strict percent-encoding: only unreserved characters pass.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Runs the handshake over the raw transport. On success the retained
/// [`AuthRequest`] becomes registration context and the caller switches
/// framing on; no frame may be sent before this returns.
pub async fn authorize<S>(stream: &mut S, conf: &LocalConf) -> Result<AuthRequest, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(CONNECT_GREETING.as_bytes()).await?;

    let request = build_auth_request(conf)?;
    let mut line = serde_json::to_string(&request)
        .map_err(|e| AgentError::Config(format!("auth request encode: {e}")))?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;

    let raw = read_response_line(stream).await?;
    let response: AuthResponse = serde_json::from_str(raw.trim_end()).map_err(|_| {
        AgentError::MangledResponse(format!("authorization response {:?}", raw.trim_end()))
    })?;

    if !response.is_ok() {
        let status = match response.error_msg {
            Some(msg) => format!("{} ({msg})", response.status),
            None => response.status,
        };
        return Err(AgentError::Authentication {
            email: conf.email(),
            status,
        });
    }

    debug!(email = %conf.email(), "authorization accepted");
    Ok(request)
}

/// Reads the single response line one byte at a time. Framed data follows
/// immediately after the newline, so no read-ahead buffering is allowed
/// here.
async fn read_response_line<S>(stream: &mut S) -> Result<String, AgentError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(AgentError::PeerClosed)
            }
            Err(e) => return Err(AgentError::Io(e)),
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_RESPONSE_LINE {
            return Err(AgentError::MangledResponse(
                "authorization response line exceeds 16KiB".into(),
            ));
        }
    }
    String::from_utf8(line)
        .map_err(|_| AgentError::MangledResponse("authorization response is not UTF-8".into()))
}

//! Authentication plugins.
//!
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`
//!   for the fast path. The full path sends the password in clear over TLS,
//!   or RSA-encrypted with the server's public key otherwise.
//! - `sha256_password`: always the full path.
//! - `mysql_clear_password`: clear text, only allowed over TLS.

use rand::RngCore;
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// The server wants the full password
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// The plugins this driver can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2,
    Sha256,
    ClearPassword,
}

impl AuthPlugin {
    /// Map a plugin name from the handshake or an auth-switch request.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Some(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Some(AuthPlugin::CachingSha2),
            plugins::SHA256_PASSWORD => Some(AuthPlugin::Sha256),
            plugins::MYSQL_CLEAR_PASSWORD => Some(AuthPlugin::ClearPassword),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256 => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
        }
    }

    /// First auth response for this plugin.
    ///
    /// `secure` says whether the transport is TLS. Over a plain transport,
    /// `sha256_password` asks for the public key (a single 0x01 byte) and
    /// `mysql_clear_password` refuses to send anything. A connection with a
    /// configured server key encrypts for `sha256_password` itself.
    pub fn initial_response(self, password: &str, seed: &[u8], secure: bool) -> Option<Vec<u8>> {
        match self {
            AuthPlugin::NativePassword => Some(mysql_native_password(password, seed)),
            AuthPlugin::CachingSha2 => Some(caching_sha2_password(password, seed)),
            AuthPlugin::Sha256 if password.is_empty() => Some(vec![0]),
            AuthPlugin::Sha256 if secure => Some(clear_password(password)),
            AuthPlugin::Sha256 => Some(vec![1]),
            AuthPlugin::ClearPassword if secure => Some(clear_password(password)),
            AuthPlugin::ClearPassword => None,
        }
    }
}

/// Strip the NUL that servers append to the 20-byte scramble.
fn scramble_seed(auth_data: &[u8]) -> &[u8] {
    if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    }
}

/// mysql_native_password response; empty for an empty password.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = &auth_data[..auth_data.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast-auth response; empty for an empty password.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = scramble_seed(auth_data);

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();
    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

/// NUL-terminated clear password, for TLS transports only.
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Random bytes from the OS generator.
pub fn generate_nonce(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// NUL-terminated password XORed with the (cycled) seed.
pub fn xor_password_with_seed(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut out = clear_password(password);
    if seed.is_empty() {
        return out;
    }
    for (i, b) in out.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }
    out
}

/// Full-auth response over a plain transport: the XORed password encrypted
/// with the server's RSA public key (PEM, SPKI or PKCS#1).
///
/// Servers from 8.0.5 on expect OAEP padding; older ones PKCS#1 v1.5.
pub fn sha256_password_rsa(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>, String> {
    let seed = scramble_seed(seed);
    if seed.is_empty() {
        return Err("auth seed is empty".to_string());
    }
    let message = xor_password_with_seed(password, seed);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| format!("server public key is not valid UTF-8 PEM: {e}"))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| format!("failed to parse server RSA public key: {e}"))?;

    if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &message)
            .map_err(|e| format!("RSA OAEP encryption failed: {e}"))
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &message)
            .map_err(|e| format!("RSA PKCS#1 v1.5 encryption failed: {e}"))
    }
}

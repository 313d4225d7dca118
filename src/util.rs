use base64::prelude::*;
use rand::RngCore as _;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

/// Random, prefixed identifier (`req-…`, `crt-…`). Collision-free in
/// practice; never reused by construction.
pub(crate) fn new_id(prefix: &str) -> String {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("{prefix}-{}", base64url(&raw))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

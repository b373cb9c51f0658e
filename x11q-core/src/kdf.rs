//! HKDF-SHA256 helpers shared by the code, PAKE and handshake key schedules.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Fill `out` from HKDF-Expand. Every caller asks for far less than the
/// 255 * 32 byte ceiling, the only way expand can fail.
pub(crate) fn expand(hk: &Hkdf<Sha256>, info: &[&[u8]], out: &mut [u8]) {
    let ok = hk.expand_multi_info(info, out).is_ok();
    debug_assert!(ok, "hkdf output too long");
}

pub(crate) fn expand_32(hk: &Hkdf<Sha256>, info: &[&[u8]]) -> [u8; 32] {
    let mut out = [0u8; 32];
    expand(hk, info, &mut out);
    out
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn mac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time check of `tag` against HMAC-SHA256 over `parts`.
pub(crate) fn verify_mac(key: &[u8; 32], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = keyed(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

fn keyed(key: &[u8; 32]) -> HmacSha256 {
    // HMAC takes keys of any length.
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    }
}

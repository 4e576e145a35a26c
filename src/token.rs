use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Random bytes behind every capability token (hex encoded, so 64 characters).
pub const TOKEN_BYTES: usize = 32;

/// Issues a capability token for a new attachment. The value carries no
/// information about the row it is bound to.
pub fn issue_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn token_matches(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

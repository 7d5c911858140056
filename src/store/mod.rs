pub mod error;
pub mod memory;
pub mod traits;

use rand::RngCore;

/// Generates a fresh record id: 12 random bytes, hex-encoded.
pub(crate) fn new_record_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

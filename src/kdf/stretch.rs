use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// Sequential key-stretching primitive.
///
/// Called twice per derivation: once to expand `(password, salt)` into all
/// blocks, once to fold `(password, mixed blocks)` into the derived key.
/// Implementations must be deterministic and fill all of `out`.
pub trait Stretch: Send + 'static {
    fn stretch(&self, password: &[u8], salt: &[u8], out: &mut [u8]);
}

/// PBKDF2-HMAC-SHA256 with a single iteration, as scrypt specifies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbkdf2Sha256;

impl Stretch for Pbkdf2Sha256 {
    fn stretch(&self, password: &[u8], salt: &[u8], out: &mut [u8]) {
        pbkdf2_hmac::<Sha256>(password, salt, 1, out);
    }
}

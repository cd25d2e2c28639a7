use crate::error::{AgentError, Result};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;
use tracing::trace;

pub const PRIME: u128 = 162_259_276_829_213_363_391_578_010_288_127;
pub const GENERATOR: u128 = 5;

const BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// `a * b mod m` without overflowing; requires `m < 2^127`.
fn mul_mod(mut a: u128, mut b: u128, m: u128) -> u128 {
    a %= m;
    b %= m;
    let mut result = 0u128;
    while b > 0 {
        if b & 1 == 1 {
            result = (result + a) % m;
        }
        a = (a << 1) % m;
        b >>= 1;
    }
    result
}

/// Square-and-multiply modular exponentiation.
pub fn mod_pow(mut base: u128, mut exponent: u128, modulus: u128) -> u128 {
    let mut result = 1u128;
    base %= modulus;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = mul_mod(result, base, modulus);
        }
        exponent >>= 1;
        base = mul_mod(base, base, modulus);
    }
    result
}

pub fn public_key(private_key: u128) -> u128 {
    mod_pow(GENERATOR, private_key, PRIME)
}

pub fn shared_secret(peer_public: u128, private_key: u128) -> u128 {
    mod_pow(peer_public, private_key, PRIME)
}

/// Fresh 128-bit private exponent.
pub fn private_key(rng: &mut dyn RngCore) -> u128 {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    u128::from_be_bytes(bytes)
}

/// Derive the AES key and IV from a shared secret.
///
/// key = md5(decimal(secret)), iv = md5(key ‖ decimal(secret)).
pub fn derive_keys(shared: u128) -> ([u8; 16], [u8; 16]) {
    let decimal = shared.to_string();

    let key: [u8; 16] = Md5::digest(decimal.as_bytes()).into();

    let mut hasher = Md5::new();
    hasher.update(key);
    hasher.update(decimal.as_bytes());
    let iv: [u8; 16] = hasher.finalize().into();

    (key, iv)
}

/// AES-128-CBC with PKCS#7 padding.
pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// AES-128-CBC decryption followed by pad stripping.
///
/// The last byte gives the pad length; that many bytes are removed and the
/// remaining text is trimmed of surrounding whitespace.
pub fn decrypt(ciphertext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(AgentError::Cipher(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_SIZE
        )));
    }

    let plain = Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| AgentError::Cipher(e.to_string()))?;

    let pad = plain.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > plain.len() {
        return Err(AgentError::Cipher(format!("invalid pad length {}", pad)));
    }

    let unpadded = &plain[..plain.len() - pad];
    Ok(unpadded.trim_ascii().to_vec())
}

/// Ephemeral key material for one `keyinit` → `password` exchange.
pub struct KeySession {
    private_key: u128,
    public_key: u128,
    shared_secret: u128,
    key: [u8; 16],
    iv: [u8; 16],
}

impl KeySession {
    /// Generate a key pair and derive the symmetric keys against `peer_public`.
    ///
    /// `peer_public` is the decimal string the hypervisor sends as the
    /// `keyinit` value.
    pub fn negotiate(peer_public: &str, rng: &mut dyn RngCore) -> Result<Self> {
        let peer = parse_public(peer_public)?;
        Ok(Self::from_private(private_key(rng), peer))
    }

    pub fn from_private(private_key: u128, peer_public: u128) -> Self {
        let public_key = public_key(private_key);
        let shared_secret = shared_secret(peer_public, private_key);
        let (key, iv) = derive_keys(shared_secret);
        trace!("Derived key session");
        Self {
            private_key,
            public_key,
            shared_secret,
            key,
            iv,
        }
    }

    pub fn public_key(&self) -> u128 {
        self.public_key
    }

    pub fn shared_secret(&self) -> u128 {
        self.shared_secret
    }

    /// Decrypt a base64 encoded password ciphertext.
    pub fn decrypt_password(&self, encoded: &str) -> Result<String> {
        let ciphertext = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AgentError::Cipher(format!("invalid base64: {}", e)))?;
        let plain = decrypt(&ciphertext, &self.key, &self.iv)?;
        String::from_utf8(plain).map_err(|_| AgentError::Cipher("password is not UTF-8".into()))
    }

    /// Encrypt with this session's keys; the hypervisor-side counterpart of
    /// [`KeySession::decrypt_password`].
    pub fn encrypt_password(&self, password: &str) -> String {
        STANDARD.encode(encrypt(password.as_bytes(), &self.key, &self.iv))
    }
}

impl std::fmt::Debug for KeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySession")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Drop for KeySession {
    fn drop(&mut self) {
        self.private_key = 0;
        self.shared_secret = 0;
        self.key = [0; 16];
        self.iv = [0; 16];
    }
}

fn parse_public(text: &str) -> Result<u128> {
    let value: u128 = text
        .trim()
        .parse()
        .map_err(|_| AgentError::Cipher(format!("invalid public key '{}'", text.trim())))?;
    Ok(value % PRIME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_mod_pow_small_values() {
        assert_eq!(mod_pow(5, 3, 13), 8);
        assert_eq!(mod_pow(2, 10, 1000), 24);
        assert_eq!(mod_pow(7, 0, 11), 1);
    }

    #[test]
    fn test_mod_pow_matches_fermat() {
        // PRIME is prime, so g^(p-1) == 1.
        assert_eq!(mod_pow(GENERATOR, PRIME - 1, PRIME), 1);
    }

    #[test]
    fn test_shared_secret_symmetry() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            let a = private_key(&mut rng);
            let b = private_key(&mut rng);
            let (pub_a, pub_b) = (public_key(a), public_key(b));
            assert_eq!(shared_secret(pub_b, a), shared_secret(pub_a, b));
        }
    }

    #[test]
    fn test_derive_keys_is_md5_of_decimal() {
        let (key, iv) = derive_keys(12345);
        let expected_key: [u8; 16] = Md5::digest(b"12345").into();
        assert_eq!(key, expected_key);

        let mut hasher = Md5::new();
        hasher.update(expected_key);
        hasher.update(b"12345");
        let expected_iv: [u8; 16] = hasher.finalize().into();
        assert_eq!(iv, expected_iv);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (key, iv) = derive_keys(987_654_321);
        for plaintext in ["s3cret", "exactly16bytes!!", ""] {
            let ciphertext = encrypt(plaintext.as_bytes(), &key, &iv);
            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
            assert_eq!(decrypt(&ciphertext, &key, &iv).unwrap(), plaintext.as_bytes());
        }
    }

    #[test]
    fn test_decrypt_trims_whitespace() {
        let (key, iv) = derive_keys(1);
        let ciphertext = encrypt(b"  pass word\n", &key, &iv);
        assert_eq!(decrypt(&ciphertext, &key, &iv).unwrap(), b"pass word");
    }

    #[test]
    fn test_decrypt_rejects_bad_length() {
        let (key, iv) = derive_keys(1);
        assert!(decrypt(&[0u8; 15], &key, &iv).is_err());
        assert!(decrypt(&[], &key, &iv).is_err());
    }

    #[test]
    fn test_session_password_exchange() {
        let mut rng = StdRng::seed_from_u64(7);
        let host_private = private_key(&mut rng);
        let host_public = public_key(host_private);

        let guest = KeySession::negotiate(&host_public.to_string(), &mut rng).unwrap();
        let host = KeySession::from_private(host_private, guest.public_key());
        assert_eq!(guest.shared_secret(), host.shared_secret());

        let wire = host.encrypt_password("correct horse");
        assert_eq!(guest.decrypt_password(&wire).unwrap(), "correct horse");
    }

    #[test]
    fn test_negotiate_rejects_non_numeric_key() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(KeySession::negotiate("abc", &mut rng).is_err());
    }
}

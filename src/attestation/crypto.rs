//! AES-CBC codec binding an attestation token to the credential that requested it.
//!
//! The key is the credential's `sub` claim with hyphens removed (32 ASCII bytes, so AES-256) and
//! the IV is the first 16 ASCII bytes of its `jti` claim. Ciphertext is PKCS#7 padded and
//! encoded with the standard base64 alphabet.

// crates.io
use aes::Aes256;
use base64::{Engine, engine::general_purpose::STANDARD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
// self
use crate::{_prelude::*, auth::UnverifiedClaims};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Failures of the attestation codec.
#[derive(Debug, ThisError)]
pub enum CryptoError {
	/// The credential's `sub` claim cannot produce a 32-byte key.
	#[error("Credential subject cannot be used as a key: {reason}.")]
	InvalidKey {
		/// What was wrong with the subject.
		reason: String,
	},
	/// The credential's `jti` claim cannot produce a 16-byte IV.
	#[error("Credential token id cannot be used as an IV: {reason}.")]
	InvalidIv {
		/// What was wrong with the token id.
		reason: String,
	},
	/// The ciphertext is not valid base64.
	#[error("Ciphertext is not valid base64.")]
	Base64(#[from] base64::DecodeError),
	/// The ciphertext length is not a positive multiple of the block size.
	#[error("Ciphertext length {0} is not a positive multiple of the block size.")]
	Length(usize),
	/// The decrypted payload carries invalid PKCS#7 padding.
	#[error("Decrypted payload has invalid padding.")]
	Padding,
	/// The decrypted payload is not UTF-8.
	#[error("Decrypted payload is not UTF-8.")]
	Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypts `plaintext` for the credential `credential_jwt` and returns base64 ciphertext.
pub fn encrypt(plaintext: &str, credential_jwt: &str) -> Result<String> {
	let (key, iv) = derive_key_iv(credential_jwt)?;
	let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
		.map_err(|e| CryptoError::InvalidKey { reason: e.to_string() })?
		.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

	Ok(STANDARD.encode(ciphertext))
}

/// Reverses [`encrypt`] for the same credential.
pub fn decrypt(ciphertext: &str, credential_jwt: &str) -> Result<String> {
	let (key, iv) = derive_key_iv(credential_jwt)?;
	let bytes = STANDARD.decode(ciphertext.trim()).map_err(CryptoError::from)?;

	if bytes.is_empty() || bytes.len() % BLOCK_LEN != 0 {
		return Err(CryptoError::Length(bytes.len()).into());
	}

	let plaintext = Aes256CbcDec::new_from_slices(&key, &iv)
		.map_err(|e| CryptoError::InvalidKey { reason: e.to_string() })?
		.decrypt_padded_vec_mut::<Pkcs7>(&bytes)
		.map_err(|_| CryptoError::Padding)?;

	Ok(String::from_utf8(plaintext).map_err(CryptoError::from)?)
}

fn derive_key_iv(credential_jwt: &str) -> Result<([u8; KEY_LEN], [u8; IV_LEN])> {
	let claims = UnverifiedClaims::parse(credential_jwt)?;
	let sub = claims.require_sub()?;
	let jti = claims.require_jti()?;
	let stripped = sub.replace('-', "");
	let key: [u8; KEY_LEN] = stripped.as_bytes().try_into().map_err(|_| CryptoError::InvalidKey {
		reason: format!("expected {KEY_LEN} bytes after removing hyphens, got {}", stripped.len()),
	})?;
	let iv: [u8; IV_LEN] = jti
		.as_bytes()
		.get(..IV_LEN)
		.and_then(|prefix| prefix.try_into().ok())
		.ok_or_else(|| CryptoError::InvalidIv {
			reason: format!("expected at least {IV_LEN} bytes, got {}", jti.len()),
		})?;

	Ok((key, iv))
}

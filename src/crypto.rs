// Copyright 2026 The hardkey-installer Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Envelope encryption, signing, and password handling.
//!
//! The wire formats here are fixed: devices already in the field carry
//! envelopes produced by `openssl enc -a -aes-256-cbc -md sha256` and must
//! keep decrypting.  The passphrase envelope adds `-pbkdf2`; the AES leg
//! of the RSA-wrapped envelope uses the legacy EVP_BytesToKey derivation.
//! Any change to the framing must version the first field of the envelope.

use anyhow::{anyhow, bail, Context, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rand::rand_bytes;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use openssl::symm::{decrypt as aes_decrypt, encrypt as aes_encrypt, Cipher};
use rand::Rng;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::HardkeyError;

/// Iterations of the AES envelope KDF; matches `openssl enc -pbkdf2`.
const ENVELOPE_PBKDF2_ITERS: usize = 10_000;
/// Iterations used to harden a user secret before it can unlock blob0.
#[cfg(not(test))]
const USER_SECRET_PBKDF2_ITERS: usize = 5_000_000;
/// The full derivation takes seconds by design; pointless in unit tests.
#[cfg(test)]
const USER_SECRET_PBKDF2_ITERS: usize = 1_000;
/// Magic prefix of an OpenSSL salted symmetric ciphertext.
const SALTED_MAGIC: &[u8; 8] = b"Salted__";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

/// Streaming SHA-256 of a whole file, as a hex string.
pub fn sha256_hex_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = openssl::sha::Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finish()))
}

pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    rand_bytes(&mut buf).context("gathering entropy")?;
    Ok(buf)
}

/// Generate a printable secret: `n` random bytes, base64-encoded.  Tools fed
/// passphrases on stdin truncate at NUL bytes, so raw entropy is never used
/// as a passphrase directly.
pub fn random_secret(n: usize) -> Result<String> {
    Ok(base64::encode(random_bytes(n)?))
}

const PASSWORD_ALPHABET: &str =
    "!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";

/// Generate a random password over `alphabet` (full printable set if None).
pub fn generate_password(length: usize, alphabet: Option<&str>) -> Result<String> {
    if length < 12 {
        bail!("password is too short ({} characters)", length);
    }
    let alphabet: Vec<char> = alphabet.unwrap_or(PASSWORD_ALPHABET).chars().collect();
    let mut rng = rand::thread_rng();
    Ok((0..length)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect())
}

pub fn generate_salt() -> Result<String> {
    generate_password(30, None)
}

/// Estimated entropy of a password in bits: log2 of the character space
/// times the length.
pub fn password_strength(password: &str) -> f64 {
    if password.is_empty() {
        return 0.0;
    }
    let mut lower = false;
    let mut upper = false;
    let mut digit = false;
    let mut special = false;
    for c in password.chars() {
        if c.is_ascii_digit() {
            digit = true;
        } else if c.is_ascii_lowercase() {
            lower = true;
        } else if c.is_ascii_uppercase() {
            upper = true;
        } else {
            special = true;
        }
    }
    let mut space = 0u32;
    if lower {
        space += 26;
    }
    if upper {
        space += 26;
    }
    if digit {
        space += 10;
    }
    if special {
        space += 20;
    }
    f64::from(space).log2() * password.len() as f64
}

/// Reject passwords containing characters outside the accepted set (the
/// header-based volume tooling is stricter than LUKS) or weaker than
/// `min_entropy` bits.
pub fn validate_password(password: &str, min_entropy: f64) -> Result<()> {
    for c in password.chars() {
        if !PASSWORD_ALPHABET.contains(c) {
            return Err(anyhow!(HardkeyError::InvalidParameter)
                .context(format!("invalid character {:?} in password", c)));
        }
    }
    if password_strength(password) < min_entropy {
        return Err(
            anyhow!(HardkeyError::InvalidParameter).context("password is not strong enough")
        );
    }
    Ok(())
}

pub fn pbkdf2_hex(password: &[u8], salt: &[u8], iterations: usize, len: usize) -> Result<String> {
    let mut out = vec![0u8; len];
    openssl::pkcs5::pbkdf2_hmac(password, salt, iterations, MessageDigest::sha256(), &mut out)
        .context("deriving key with PBKDF2")?;
    Ok(hex::encode(out))
}

/// Harden a user secret into the passphrase actually protecting blob0.
/// Deliberately expensive so that brute-forcing the user blob off a stolen
/// key costs ~seconds per candidate.
pub fn harden_user_secret(secret: &str, salt: &str) -> Result<String> {
    pbkdf2_hex(
        secret.as_bytes(),
        salt.as_bytes(),
        USER_SECRET_PBKDF2_ITERS,
        32,
    )
}

/// Data recovered from the ascii armor: the one-character type tag records
/// whether the original was text or bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plain {
    Bytes(Vec<u8>),
    Text(String),
}

impl Plain {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Plain::Bytes(b) => b,
            Plain::Text(s) => s.as_bytes(),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Plain::Text(s) => Ok(s),
            Plain::Bytes(b) => String::from_utf8(b).context("armored payload is not UTF-8"),
        }
    }
}

/// Encode bytes or text into a single ASCII line.  The first character is a
/// type tag: `b` raw bytes, `B` LZMA-compressed bytes, `s` raw string, `S`
/// LZMA-compressed string.  Compression is only kept when it actually
/// shrinks the payload.
pub fn ascii_encode(data: &Plain) -> Result<String> {
    let raw = data.as_bytes();
    let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
    enc.write_all(raw).context("compressing payload")?;
    let compressed = enc.finish().context("finishing compression")?;

    let (tag, body) = if compressed.len() < raw.len() {
        match data {
            Plain::Bytes(_) => ('B', compressed),
            Plain::Text(_) => ('S', compressed),
        }
    } else {
        match data {
            Plain::Bytes(_) => ('b', raw.to_vec()),
            Plain::Text(_) => ('s', raw.to_vec()),
        }
    };
    Ok(format!("{}{}", tag, base64::encode(body)))
}

pub fn ascii_decode(data: &str) -> Result<Plain> {
    let mut chars = data.chars();
    let tag = chars
        .next()
        .ok_or_else(|| anyhow!("empty armored payload"))?;
    let body = base64::decode(chars.as_str()).context("decoding armored payload")?;
    let unpack = |body: Vec<u8>| -> Result<Vec<u8>> {
        let mut out = Vec::new();
        xz2::read::XzDecoder::new(&body[..])
            .read_to_end(&mut out)
            .context("decompressing armored payload")?;
        Ok(out)
    };
    match tag {
        'b' => Ok(Plain::Bytes(body)),
        'B' => Ok(Plain::Bytes(unpack(body)?)),
        's' => Ok(Plain::Text(
            String::from_utf8(body).context("armored payload is not UTF-8")?,
        )),
        'S' => Ok(Plain::Text(
            String::from_utf8(unpack(body)?).context("armored payload is not UTF-8")?,
        )),
        other => bail!("invalid armor type tag {:?}", other),
    }
}

fn envelope_key_iv(password: &[u8], salt: &[u8]) -> Result<([u8; 32], [u8; 16])> {
    let mut keyiv = [0u8; 48];
    openssl::pkcs5::pbkdf2_hmac(
        password,
        salt,
        ENVELOPE_PBKDF2_ITERS,
        MessageDigest::sha256(),
        &mut keyiv,
    )
    .context("deriving envelope key")?;
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&keyiv[..32]);
    iv.copy_from_slice(&keyiv[32..]);
    Ok((key, iv))
}

fn salted_encrypt(password: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let salt = random_bytes(8)?;
    let (key, iv) = envelope_key_iv(password, &salt)?;
    let ct = aes_encrypt(Cipher::aes_256_cbc(), &key, Some(&iv), plaintext)
        .context("encrypting payload")?;
    let mut out = Vec::with_capacity(16 + ct.len());
    out.extend_from_slice(SALTED_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ct);
    Ok(out)
}

fn salted_decrypt(password: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 || &data[..8] != SALTED_MAGIC {
        bail!("missing salt header in ciphertext");
    }
    let (key, iv) = envelope_key_iv(password, &data[8..16])?;
    aes_decrypt(Cipher::aes_256_cbc(), &key, Some(&iv), &data[16..])
        .map_err(|_| anyhow!(HardkeyError::WrongPassphrase))
}

/// EVP_BytesToKey with SHA-256 and a single round, as `openssl enc` derives
/// keys when `-pbkdf2` is NOT given.  The RSA-wrapped envelopes in the
/// field use this legacy derivation for their AES leg: the wrapping key is
/// already 256 bits of fresh entropy, so key stretching buys nothing
/// there, and the deployed format never had it.
fn legacy_key_iv(password: &[u8], salt: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut derived = Vec::with_capacity(64);
    let mut block = Vec::new();
    while derived.len() < 48 {
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(&block);
        hasher.update(password);
        hasher.update(salt);
        block = hasher.finish().to_vec();
        derived.extend_from_slice(&block);
    }
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&derived[..32]);
    iv.copy_from_slice(&derived[32..48]);
    (key, iv)
}

fn legacy_salted_encrypt(password: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let salt = random_bytes(8)?;
    let (key, iv) = legacy_key_iv(password, &salt);
    let ct = aes_encrypt(Cipher::aes_256_cbc(), &key, Some(&iv), plaintext)
        .context("encrypting payload")?;
    let mut out = Vec::with_capacity(16 + ct.len());
    out.extend_from_slice(SALTED_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ct);
    Ok(out)
}

fn legacy_salted_decrypt(password: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 || &data[..8] != SALTED_MAGIC {
        bail!("missing salt header in ciphertext");
    }
    let (key, iv) = legacy_key_iv(password, &data[8..16]);
    aes_decrypt(Cipher::aes_256_cbc(), &key, Some(&iv), &data[16..])
        .map_err(|_| anyhow!(HardkeyError::WrongPassphrase))
}

/// The symmetric leg of an envelope travels as the base64 TEXT `openssl
/// enc -a` emits, armored as a string; deployed keys carry exactly this.
fn armor_ciphertext(ct: &[u8]) -> Result<String> {
    ascii_encode(&Plain::Text(base64::encode(ct)))
}

fn unarmor_ciphertext(armored: &str) -> Result<Vec<u8>> {
    let text = ascii_decode(armored)?.into_string()?;
    base64::decode(text.trim()).context("decoding envelope ciphertext")
}

/// Symmetric envelope: AES-256-CBC under a PBKDF2-derived key.
/// Produces `"sha256:" + armor(ciphertext)`.
pub struct PassphraseCipher {
    passphrase: String,
}

impl PassphraseCipher {
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.to_string(),
        }
    }

    pub fn encrypt(&self, data: &Plain) -> Result<String> {
        let ct = salted_encrypt(self.passphrase.as_bytes(), data.as_bytes())?;
        Ok(format!("sha256:{}", armor_ciphertext(&ct)?))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Plain> {
        let (digest, armored) = envelope
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid envelope format"))?;
        if digest.is_empty() || armored.is_empty() {
            bail!("invalid envelope format");
        }
        let ct = unarmor_ciphertext(armored)?;
        let pt = salted_decrypt(self.passphrase.as_bytes(), &ct)?;
        Ok(Plain::Bytes(pt))
    }

    /// HMAC-SHA256 signature, hex-encoded.
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        let key = PKey::hmac(self.passphrase.as_bytes()).context("building HMAC key")?;
        let mut signer =
            Signer::new(MessageDigest::sha256(), &key).context("creating HMAC signer")?;
        signer.update(data).context("feeding HMAC")?;
        Ok(hex::encode(signer.sign_to_vec().context("signing")?))
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        let expected = self.sign(data)?;
        if expected.len() == signature.len()
            && openssl::memcmp::eq(expected.as_bytes(), signature.as_bytes())
        {
            Ok(())
        } else {
            Err(anyhow!(HardkeyError::SignatureInvalid).context("HMAC signature mismatch"))
        }
    }
}

/// Asymmetric envelope and signatures over an RSA keypair in PEM form.
/// Encryption wraps a fresh 32-byte AES key under the public key; the
/// envelope is `"sha256:" + armor(wrapped_key) + ":rsa:" + armor(payload)`.
/// Unlike the passphrase envelope, the AES leg derives its key with the
/// legacy single-round EVP_BytesToKey scheme, not PBKDF2.
pub struct KeyCipher {
    private: Option<PKey<Private>>,
    public: Option<PKey<Public>>,
}

impl KeyCipher {
    pub fn new(private_pem: Option<&[u8]>, public_pem: Option<&[u8]>) -> Result<Self> {
        let private = match private_pem {
            Some(pem) => Some(
                PKey::private_key_from_pem(pem).context("parsing private key PEM")?,
            ),
            None => None,
        };
        let public = match public_pem {
            Some(pem) => {
                Some(PKey::public_key_from_pem(pem).context("parsing public key PEM")?)
            }
            None => None,
        };
        Ok(Self { private, public })
    }

    pub fn from_private_pem(pem: &[u8]) -> Result<Self> {
        Self::new(Some(pem), None)
    }

    pub fn from_public_pem(pem: &[u8]) -> Result<Self> {
        Self::new(None, Some(pem))
    }

    fn rsa_public(&self) -> Result<Rsa<Public>> {
        self.public
            .as_ref()
            .ok_or_else(|| anyhow!("no public key available"))?
            .rsa()
            .context("key is not RSA")
    }

    fn rsa_private(&self) -> Result<Rsa<Private>> {
        self.private
            .as_ref()
            .ok_or_else(|| anyhow!("no private key available"))?
            .rsa()
            .context("key is not RSA")
    }

    pub fn encrypt(&self, data: &Plain) -> Result<String> {
        let rsa = self.rsa_public()?;

        // wrap a fresh symmetric key
        let symkey = random_secret(32)?;
        let mut wrapped = vec![0u8; rsa.size() as usize];
        let n = rsa
            .public_encrypt(symkey.as_bytes(), &mut wrapped, Padding::PKCS1)
            .context("wrapping symmetric key")?;
        wrapped.truncate(n);

        let ct = legacy_salted_encrypt(symkey.as_bytes(), data.as_bytes())?;
        Ok(format!(
            "sha256:{}:rsa:{}",
            ascii_encode(&Plain::Bytes(wrapped))?,
            armor_ciphertext(&ct)?
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Plain> {
        let rsa = self.rsa_private()?;
        let fields: Vec<&str> = envelope.split(':').collect();
        if fields.len() != 4 || fields[1].is_empty() || fields[3].is_empty() {
            bail!("invalid envelope format");
        }
        if fields[2] != "rsa" {
            bail!("unsupported wrapping algorithm {:?}", fields[2]);
        }
        let wrapped = ascii_decode(fields[1])?;
        let mut symkey = vec![0u8; rsa.size() as usize];
        let n = rsa
            .private_decrypt(wrapped.as_bytes(), &mut symkey, Padding::PKCS1)
            .map_err(|_| anyhow!(HardkeyError::WrongPassphrase))?;
        symkey.truncate(n);

        let ct = unarmor_ciphertext(fields[3])?;
        let pt = legacy_salted_decrypt(&symkey, &ct)?;
        Ok(Plain::Bytes(pt))
    }

    /// Sign the SHA-256 hex digest of `data` with the private key.
    /// Output format: `"sha256|" + armor(signature)`.
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        let rsa = self.rsa_private()?;
        let digest = sha256_hex(data);
        let mut sig = vec![0u8; rsa.size() as usize];
        let n = rsa
            .private_encrypt(digest.as_bytes(), &mut sig, Padding::PKCS1)
            .context("creating signature")?;
        sig.truncate(n);
        Ok(format!("sha256|{}", ascii_encode(&Plain::Bytes(sig))?))
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        let rsa = self.rsa_public()?;
        let (algo, armored) = signature
            .split_once('|')
            .ok_or_else(|| anyhow!(HardkeyError::SignatureInvalid).context("bad signature format"))?;
        if algo != "sha256" {
            return Err(anyhow!(HardkeyError::SignatureInvalid)
                .context(format!("unsupported signature digest {:?}", algo)));
        }
        let sig = ascii_decode(armored)?;
        let mut recovered = vec![0u8; rsa.size() as usize];
        let n = rsa
            .public_decrypt(sig.as_bytes(), &mut recovered, Padding::PKCS1)
            .map_err(|_| anyhow!(HardkeyError::SignatureInvalid))?;
        recovered.truncate(n);
        if recovered == sha256_hex(data).as_bytes() {
            Ok(())
        } else {
            Err(anyhow!(HardkeyError::SignatureInvalid).context("digest mismatch"))
        }
    }
}

/// Generate a 2048-bit RSA keypair, returning (private PEM, public PEM).
pub fn generate_rsa_keypair() -> Result<(Vec<u8>, Vec<u8>)> {
    let rsa = Rsa::generate(2048).context("generating RSA key")?;
    let private = rsa
        .private_key_to_pem()
        .context("encoding private key PEM")?;
    let public = rsa
        .public_key_to_pem()
        .context("encoding public key PEM")?;
    Ok((private, public))
}

/// A decryptor/signer instantiated from its declarative description in a
/// layout specification or configuration.
pub enum CryptoEngine {
    Pass(PassphraseCipher),
    Key(KeyCipher),
}

impl CryptoEngine {
    pub fn from_spec(spec: &crate::spec::CryptoSpec, base_dir: Option<&Path>) -> Result<Self> {
        use crate::spec::CryptoSpecKind;
        let load = |p: &str| -> Result<Vec<u8>> {
            let path = if Path::new(p).is_absolute() {
                std::path::PathBuf::from(p)
            } else if let Some(dir) = base_dir {
                dir.join(p)
            } else {
                std::path::PathBuf::from(p)
            };
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))
        };
        match spec.kind {
            CryptoSpecKind::Password => {
                let password = spec
                    .password
                    .as_ref()
                    .ok_or_else(|| anyhow!("password decryptor without a password"))?;
                Ok(CryptoEngine::Pass(PassphraseCipher::new(password)))
            }
            CryptoSpecKind::Key => {
                let private = spec.private_key_file.as_deref().map(load).transpose()?;
                let public = spec.public_key_file.as_deref().map(load).transpose()?;
                Ok(CryptoEngine::Key(KeyCipher::new(
                    private.as_deref(),
                    public.as_deref(),
                )?))
            }
            CryptoSpecKind::Certificate => {
                let cert_pem = load(
                    spec.cert_file
                        .as_deref()
                        .ok_or_else(|| anyhow!("certificate decryptor without a cert-file"))?,
                )?;
                let cert = openssl::x509::X509::from_pem(&cert_pem)
                    .context("parsing certificate PEM")?;
                let public = cert
                    .public_key()
                    .context("extracting certificate public key")?
                    .public_key_to_pem()
                    .context("encoding certificate public key")?;
                let private = spec.private_key_file.as_deref().map(load).transpose()?;
                Ok(CryptoEngine::Key(KeyCipher::new(
                    private.as_deref(),
                    Some(&public),
                )?))
            }
        }
    }

    pub fn encrypt(&self, data: &Plain) -> Result<String> {
        match self {
            CryptoEngine::Pass(c) => c.encrypt(data),
            CryptoEngine::Key(c) => c.encrypt(data),
        }
    }

    pub fn decrypt(&self, envelope: &str) -> Result<Plain> {
        match self {
            CryptoEngine::Pass(c) => c.decrypt(envelope),
            CryptoEngine::Key(c) => c.decrypt(envelope),
        }
    }

    pub fn sign(&self, data: &[u8]) -> Result<String> {
        match self {
            CryptoEngine::Pass(c) => c.sign(data),
            CryptoEngine::Key(c) => c.sign(data),
        }
    }

    pub fn verify(&self, data: &[u8], signature: &str) -> Result<()> {
        match self {
            CryptoEngine::Pass(c) => c.verify(data, signature),
            CryptoEngine::Key(c) => c.verify(data, signature),
        }
    }
}

/// Verify a detached signature file over `path` made with
/// `openssl dgst -sha256 -sign`.
pub fn verify_detached_file_signature(
    path: &Path,
    signature_path: &Path,
    public_pem: &[u8],
) -> Result<()> {
    let key = PKey::public_key_from_pem(public_pem).context("parsing public key PEM")?;
    let mut signature = Vec::new();
    File::open(signature_path)
        .with_context(|| format!("opening {}", signature_path.display()))?
        .read_to_end(&mut signature)
        .with_context(|| format!("reading {}", signature_path.display()))?;

    let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha256(), &key)
        .context("creating verifier")?;
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        verifier.update(&buf[..n]).context("feeding verifier")?;
    }
    match verifier.verify(&signature) {
        Ok(true) => Ok(()),
        Ok(false) => Err(anyhow!(HardkeyError::SignatureInvalid)
            .context(format!("bad signature on {}", path.display()))),
        Err(e) => Err(anyhow!(e).context("verifying signature")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armor_roundtrip() {
        // short binary payload: stays raw
        let short = Plain::Bytes(vec![0u8, 1, 2, 255]);
        let enc = ascii_encode(&short).unwrap();
        assert!(enc.starts_with('b'));
        assert_eq!(ascii_decode(&enc).unwrap(), short);

        // repetitive text payload: compresses
        let long = Plain::Text("na ".repeat(4096));
        let enc = ascii_encode(&long).unwrap();
        assert!(enc.starts_with('S'));
        assert_eq!(ascii_decode(&enc).unwrap(), long);

        assert!(ascii_decode("zZZZZ").is_err());
        assert!(ascii_decode("").is_err());
    }

    #[test]
    fn passphrase_envelope_roundtrip() {
        let cipher = PassphraseCipher::new("correct horse battery staple");
        let secret = Plain::Text("the partition passphrase".into());
        let envelope = cipher.encrypt(&secret).unwrap();
        assert!(envelope.starts_with("sha256:"));
        assert_eq!(
            cipher.decrypt(&envelope).unwrap().into_string().unwrap(),
            "the partition passphrase"
        );

        let wrong = PassphraseCipher::new("not the passphrase");
        let err = wrong.decrypt(&envelope).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::WrongPassphrase)
        );
    }

    #[test]
    fn passphrase_envelope_large_payload() {
        // envelope must stay lossless for payloads up to 16 MiB
        let cipher = PassphraseCipher::new("a passphrase of sorts");
        let mut payload = vec![0u8; 1 << 20];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let envelope = cipher.encrypt(&Plain::Bytes(payload.clone())).unwrap();
        assert_eq!(cipher.decrypt(&envelope).unwrap().as_bytes(), &payload[..]);
    }

    #[test]
    fn hmac_sign_verify() {
        let cipher = PassphraseCipher::new("shared secret");
        let sig = cipher.sign(b"payload").unwrap();
        cipher.verify(b"payload", &sig).unwrap();
        let err = cipher.verify(b"tampered", &sig).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::SignatureInvalid)
        );
    }

    #[test]
    fn rsa_envelope_roundtrip() {
        let (private, public) = generate_rsa_keypair().unwrap();
        let encryptor = KeyCipher::from_public_pem(&public).unwrap();
        let envelope = encryptor
            .encrypt(&Plain::Text("wrapped by rsa".into()))
            .unwrap();
        let fields: Vec<&str> = envelope.split(':').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "sha256");
        assert_eq!(fields[2], "rsa");

        let decryptor = KeyCipher::from_private_pem(&private).unwrap();
        assert_eq!(
            decryptor.decrypt(&envelope).unwrap().into_string().unwrap(),
            "wrapped by rsa"
        );

        // a different key must not decrypt
        let (other_private, _) = generate_rsa_keypair().unwrap();
        let other = KeyCipher::from_private_pem(&other_private).unwrap();
        assert!(other.decrypt(&envelope).is_err());
    }

    #[test]
    fn rsa_sign_verify() {
        let (private, public) = generate_rsa_keypair().unwrap();
        let signer = KeyCipher::from_private_pem(&private).unwrap();
        let sig = signer.sign(b"attested content").unwrap();
        assert!(sig.starts_with("sha256|"));

        let verifier = KeyCipher::from_public_pem(&public).unwrap();
        verifier.verify(b"attested content", &sig).unwrap();
        let err = verifier.verify(b"other content", &sig).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(HardkeyError::SignatureInvalid)
        );
    }

    #[test]
    fn password_entropy() {
        assert_eq!(password_strength(""), 0.0);
        assert!(password_strength("aaaa") < 25.0);
        assert!(password_strength("Correct-horse-42") >= 75.0);
        validate_password("Correct-horse-42", 75.0).unwrap();
        assert!(validate_password("short", 75.0).is_err());
        assert!(validate_password("contains a tab\there", 75.0).is_err());
    }

    #[test]
    fn generated_passwords() {
        let p = generate_password(25, None).unwrap();
        assert_eq!(p.chars().count(), 25);
        assert!(generate_password(8, None).is_err());
        let hexish = generate_password(64, Some("abcdef0123456789")).unwrap();
        assert!(hexish.chars().all(|c| "abcdef0123456789".contains(c)));
    }

    #[test]
    fn legacy_derivation() {
        // deterministic, and 32+16 bytes out of repeated SHA-256 blocks
        let (key1, iv1) = legacy_key_iv(b"wrapping key", b"saltsalt");
        let (key2, iv2) = legacy_key_iv(b"wrapping key", b"saltsalt");
        assert_eq!(key1, key2);
        assert_eq!(iv1, iv2);
        // the second block extends the first, per EVP_BytesToKey
        let mut hasher = openssl::sha::Sha256::new();
        hasher.update(b"wrapping key");
        hasher.update(b"saltsalt");
        let d1 = hasher.finish();
        assert_eq!(&key1[..], &d1[..]);

        // distinct from the PBKDF2 derivation the passphrase envelope uses
        let (pkey, _) = envelope_key_iv(b"wrapping key", b"saltsalt").unwrap();
        assert_ne!(key1, pkey);

        // the two salted formats do not decrypt each other
        let legacy = legacy_salted_encrypt(b"k", b"payload").unwrap();
        assert!(salted_decrypt(b"k", &legacy).is_err());
        assert_eq!(legacy_salted_decrypt(b"k", &legacy).unwrap(), b"payload");
    }

    #[test]
    fn kdf_is_deterministic() {
        let a = pbkdf2_hex(b"pw", b"salt", 100, 32).unwrap();
        let b = pbkdf2_hex(b"pw", b"salt", 100, 32).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, pbkdf2_hex(b"pw", b"other", 100, 32).unwrap());
    }
}

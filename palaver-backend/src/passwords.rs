use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::str::FromStr;

use anyhow::{bail, Error};
use argon2::password_hash::{self, rand_core::OsRng, PasswordHashString, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::prelude::*;

use palaver_inbound::sasl::scram::ScramDigest;
use palaver_inbound::sasl::ScramCredentials;

const SCRAM_ITERATIONS: u32 = 4096;

/// A password in its stored, non-recoverable form.
pub trait StoredPassword: FromStr + Display {
    fn new(plaintext: &str) -> Result<Self, Error>;
}

/// Argon2 record backing PLAIN verification.
#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPasswordArgon2 {
    pub fn verify(&self, plaintext: &str) -> bool {
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &self.hash.password_hash())
            .is_ok()
    }
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// Salted SCRAM record in the form
/// `$<mechanism>$<iterations>$<salt>$<stored key>$<server key>`.
#[derive(Debug)]
pub struct StoredPasswordScram<D> {
    iterations: u32,
    salt: Vec<u8>,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
    _digest_type: PhantomData<D>,
}

impl<D> StoredPasswordScram<D> {
    pub fn credentials(&self) -> ScramCredentials {
        ScramCredentials {
            salt: self.salt.clone(),
            iterations: self.iterations,
            stored_key: self.stored_key.clone(),
            server_key: self.server_key.clone(),
        }
    }
}

impl<D> StoredPassword for StoredPasswordScram<D>
where
    D: ScramDigest,
{
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let salt = salt.as_str().as_bytes().to_vec();
        // The PBKDF2 derivation is the expensive part.
        let salted_password = D::pbkdf2(plaintext.as_bytes(), &salt, SCRAM_ITERATIONS);
        let client_key = D::hmac(&salted_password, b"Client Key");
        let server_key = D::hmac(&salted_password, b"Server Key");
        let stored_key = D::digest(&client_key);

        Ok(Self {
            iterations: SCRAM_ITERATIONS,
            salt,
            stored_key,
            server_key,
            _digest_type: PhantomData,
        })
    }
}

impl<D> FromStr for StoredPasswordScram<D>
where
    D: ScramDigest,
{
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('$').collect();

        if parts.len() != 6 {
            bail!("invalid SCRAM password format");
        }
        if parts[1] != D::MECHANISM.to_string() {
            bail!("SCRAM password record is for mechanism {}", parts[1]);
        }

        let iterations = parts[2].parse::<u32>()?;
        if iterations == 0 {
            bail!("SCRAM iteration count must be positive");
        }
        let salt = BASE64_STANDARD.decode(parts[3])?;
        let stored_key = BASE64_STANDARD.decode(parts[4])?;
        let server_key = BASE64_STANDARD.decode(parts[5])?;

        Ok(Self {
            iterations,
            salt,
            stored_key,
            server_key,
            _digest_type: PhantomData,
        })
    }
}

impl<D> Display for StoredPasswordScram<D>
where
    D: ScramDigest,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "${}${}${}${}${}",
            D::MECHANISM,
            self.iterations,
            BASE64_STANDARD.encode(&self.salt),
            BASE64_STANDARD.encode(&self.stored_key),
            BASE64_STANDARD.encode(&self.server_key),
        )
    }
}

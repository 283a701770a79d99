//! Session key pair generation

use crate::TransportError;
use secrecy::{ExposeSecret, SecretString};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::rand_core::OsRng;
use ssh_key::{LineEnding, PrivateKey};
use tracing::debug;

/// RSA modulus size used for session keys
pub const DEFAULT_RSA_BITS: usize = 2048;

/// A freshly generated key pair in OpenSSH text form.
///
/// The private half is kept as a [`SecretString`] so it is zeroized when
/// dropped and never shows up in `Debug` output.
#[derive(Debug, Clone)]
pub struct KeyPair {
    private_key: SecretString,
    public_key_line: String,
}

impl KeyPair {
    /// Generate an RSA-2048 key pair
    pub fn generate(comment: &str) -> Result<Self, TransportError> {
        Self::generate_rsa(DEFAULT_RSA_BITS, comment)
    }

    /// Generate an RSA key pair of the given size
    pub fn generate_rsa(bits: usize, comment: &str) -> Result<Self, TransportError> {
        debug!("Generating {}-bit RSA key pair", bits);

        let keypair = RsaKeypair::random(&mut OsRng, bits)?;
        let private = PrivateKey::new(KeypairData::from(keypair), comment)?;

        let pem = private.to_openssh(LineEnding::LF)?;
        let public_key_line = private.public_key().to_openssh()?;

        Ok(Self {
            private_key: SecretString::new(pem.as_str().to_owned()),
            public_key_line,
        })
    }

    /// OpenSSH-encoded private key
    pub fn private_key(&self) -> &SecretString {
        &self.private_key
    }

    /// `ssh-rsa AAAA... comment` line for authorized_keys
    pub fn public_key_line(&self) -> &str {
        &self.public_key_line
    }

    /// Check that the private half parses and matches the public line
    pub fn verify(&self) -> Result<(), TransportError> {
        let private = PrivateKey::from_openssh(self.private_key.expose_secret())?;
        if private.public_key().to_openssh()? != self.public_key_line {
            return Err(TransportError::Key("public key does not match private key".to_string()));
        }
        Ok(())
    }
}

//! SSH credentials for provisioned VMs
//!
//! Every VM gets a fresh ed25519 keypair and a login password. The public
//! key is handed to Terraform, the private key and password are kept in the
//! VM's Secret for the shell proxy.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use gargantua_common::{Error, Result};

const PASSWORD_LENGTH: usize = 16;

/// Secret data key of the PEM private key
pub const PRIVATE_KEY: &str = "private_key";
/// Secret data key of the authorized_keys line
pub const PUBLIC_KEY: &str = "public_key";
/// Secret data key of the login password
pub const PASSWORD: &str = "password";

/// Generated VM credentials
#[derive(Clone)]
pub struct Credentials {
    /// `ssh-ed25519 AAAA...` line
    pub public_key: String,
    /// OpenSSH PEM private key
    pub private_key: String,
    /// Alphanumeric login password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn key_error(e: ssh_key::Error) -> Error {
    Error::internal_with_context("keypair", e.to_string())
}

impl Credentials {
    /// Fresh keypair and password
    pub fn generate() -> Result<Self> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(key_error)?;
        Self::from_key(&key)
    }

    fn from_key(key: &PrivateKey) -> Result<Self> {
        Ok(Self {
            public_key: key.public_key().to_openssh().map_err(key_error)?,
            private_key: key.to_openssh(LineEnding::LF).map_err(key_error)?.to_string(),
            password: password(),
        })
    }
}

fn password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

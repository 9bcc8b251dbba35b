use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub const WG_KEY_LENGTH: usize = 32;

#[derive(Debug, Error)]
#[error("Couldn't parse the key from base64 string!")]
pub struct InvalidWgKey;

#[derive(Debug, Error)]
pub enum KeyGenerationError {
    #[error("The system randomness source failed! {}", .0)]
    Randomness(rand::Error),
    #[error("The key generator returned a public key only!")]
    PublicOnly,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgKey([u8; WG_KEY_LENGTH]);

impl WgKey {
    pub fn from_base64(key: &str) -> Result<Self, InvalidWgKey> {
        let decoded = data_encoding::BASE64
            .decode(key.trim().as_bytes())
            .map_err(|_| InvalidWgKey)?;

        decoded.as_slice().try_into()
    }

    pub fn to_base64(&self) -> String {
        data_encoding::BASE64.encode(&self.0)
    }

    /// Derives the public half, meaningful only when `self` is a private key.
    pub fn get_public(&self) -> Self {
        let secret = StaticSecret::from(self.0);

        WgKey(PublicKey::from(&secret).to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; WG_KEY_LENGTH] {
        &self.0
    }
}

// public keys are fine to print, private keys shouldn't end up in the logs by accident
impl Debug for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WgKey(..)")
    }
}

impl Display for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_base64().as_str())
    }
}

impl FromStr for WgKey {
    type Err = InvalidWgKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl From<[u8; WG_KEY_LENGTH]> for WgKey {
    fn from(value: [u8; WG_KEY_LENGTH]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for WgKey {
    type Error = InvalidWgKey;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(WgKey(value.try_into().map_err(|_| InvalidWgKey)?))
    }
}

#[derive(Debug, Clone)]
pub enum Keys {
    Pair { private: WgKey, public: WgKey },
    Public(WgKey),
}

impl Keys {
    pub fn from_public_key(key: WgKey) -> Self {
        Self::Public(key)
    }

    pub fn get_private_key(&self) -> Option<&WgKey> {
        match self {
            Self::Pair { private, .. } => Some(private),
            Self::Public(_) => None,
        }
    }

    pub fn get_public_key(&self) -> &WgKey {
        match self {
            Self::Pair { public, .. } => public,
            Self::Public(public) => public,
        }
    }

    /// Consumes the pair, leaving only the public half behind.
    pub fn split(self) -> (Option<WgKey>, WgKey) {
        match self {
            Self::Pair { private, public } => (Some(private), public),
            Self::Public(public) => (None, public),
        }
    }
}

pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> Result<Keys, KeyGenerationError>;
}

/// Generates x25519 pairs from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeyGenerator;

impl KeyGenerator for OsKeyGenerator {
    fn generate(&self) -> Result<Keys, KeyGenerationError> {
        let mut bytes = [0u8; WG_KEY_LENGTH];

        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(KeyGenerationError::Randomness)?;

        // clamping is applied by x25519 on use, the stored scalar stays as generated
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);

        Ok(Keys::Pair {
            private: WgKey(secret.to_bytes()),
            public: WgKey(public.to_bytes()),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("The private key was already claimed!")]
pub struct AlreadyClaimed;

/// A private key that can be taken out exactly once.
pub struct ClaimablePrivateKey(Option<WgKey>);

impl ClaimablePrivateKey {
    pub fn new(key: WgKey) -> Self {
        Self(Some(key))
    }

    pub fn claim(&mut self) -> Result<WgKey, AlreadyClaimed> {
        self.0.take().ok_or(AlreadyClaimed)
    }

    pub fn is_claimed(&self) -> bool {
        self.0.is_none()
    }
}

impl Debug for ClaimablePrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(_) => f.write_str("ClaimablePrivateKey(unclaimed)"),
            None => f.write_str("ClaimablePrivateKey(claimed)"),
        }
    }
}

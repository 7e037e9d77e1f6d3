//! Algorithm-tagged content digests.
//!
//! A [`Digest`] is `alg:hex` over exact bytes. Two byte sequences with the
//! same digest are treated as the same content everywhere in this crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use stow_core::error::{Result, StowError};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start a streaming digest computation.
    pub fn digester(&self) -> Digester {
        match self {
            Algorithm::Sha256 => Digester::Sha256(Sha256::default()),
            Algorithm::Sha512 => Digester::Sha512(Sha512::default()),
        }
    }
}

impl FromStr for Algorithm {
    type Err = StowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(StowError::Other(format!(
                "unsupported digest algorithm '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hasher producing a [`Digest`].
pub enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        use sha2::Digest as _;
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        use sha2::Digest as _;
        match self {
            Digester::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Digester::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// Content digest, e.g. `sha256:e3b0c442...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self::compute_with(Algorithm::Sha256, data)
    }

    /// Compute the digest of `data` with an explicit algorithm.
    pub fn compute_with(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut digester = algorithm.digester();
        digester.update(data);
        digester.finalize()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Hex-encoded hash value without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// File name used for this digest on disk (`alg-hex`).
    pub fn path_component(&self) -> String {
        format!("{}-{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = StowError;

    fn from_str(s: &str) -> Result<Self> {
        let (alg, hex) = s.split_once(':').ok_or_else(|| {
            StowError::Other(format!("invalid digest '{}': expected algorithm:hex", s))
        })?;
        let algorithm: Algorithm = alg.parse()?;
        if hex.len() != algorithm.hex_len()
            || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(StowError::Other(format!(
                "invalid digest '{}': expected {} lowercase hex characters",
                s,
                algorithm.hex_len()
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = StowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use sha2::Digest;

use crate::error::{Error, Result};

const READ_CHUNK: usize = 1024 * 256;

/// Hash used both for artifact checksums and for step identities.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Md5,
    Sha256,
}

impl Algorithm {
    /// Length of the lowercase hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            Algorithm::Md5 => 32,
            Algorithm::Sha256 => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Md5 => "md5",
            Algorithm::Sha256 => "sha256",
        }
    }

    pub fn validate_hex(self, digest: &str) -> Result<String> {
        let d = digest.trim().to_ascii_lowercase();
        if d.len() != self.hex_len() || !d.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::msg(format!(
                "'{}' is not a {} digest (expected {} hex characters)",
                digest,
                self.name(),
                self.hex_len()
            )));
        }
        Ok(d)
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_bytes<D: Digest>(bytes: &[u8]) -> String {
    let mut hasher = D::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn digest_file(algorithm: Algorithm, path: &Path) -> Result<String> {
    let file = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}: {e}", path.display())))?;
    match algorithm {
        Algorithm::Md5 => hash_reader::<md5::Md5>(file, path),
        Algorithm::Sha256 => hash_reader::<sha2::Sha256>(file, path),
    }
}

pub fn digest_text(algorithm: Algorithm, text: &str) -> String {
    match algorithm {
        Algorithm::Md5 => hash_bytes::<md5::Md5>(text.as_bytes()),
        Algorithm::Sha256 => hash_bytes::<sha2::Sha256>(text.as_bytes()),
    }
}

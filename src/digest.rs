//! Content digest computation and the supported-algorithm registry.
//!
//! A digest is a pair `(algorithm, hex)` serialized as `alg:hex`, e.g.
//! `sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824`.

use crate::errors::OciDistributionError;
use blake3::Hasher as Blake3Hasher;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest as _, Sha256, Sha512};
use std::convert::TryFrom;
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Bytes read per chunk when digesting a stream. The spec requires at least 8 KiB;
/// we use a larger default to cut down on syscalls for big blobs.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// The canonical digest of the two-byte JSON document `{}`, used for the empty
/// config and empty layer conventions.
pub const EMPTY_JSON_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// The raw bytes of the canonical empty JSON document.
pub const EMPTY_JSON_BYTES: &[u8] = b"{}";

lazy_static! {
    // Syntactic shape only: `alg:hex`, single colon, non-empty sides.
    static ref DIGEST_SHAPE: Regex = Regex::new(r"^[a-zA-Z0-9_+.-]+:[a-fA-F0-9]+$").unwrap();
}

/// A content digest algorithm supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256, the default algorithm used throughout the OCI ecosystem.
    Sha256,
    /// SHA-512.
    Sha512,
    /// BLAKE3.
    Blake3,
}

impl DigestAlgorithm {
    /// The canonical lowercase name used in `alg:hex` strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }

    /// The expected hex-encoded length for this algorithm's digest.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha512 => 128,
            DigestAlgorithm::Blake3 => 64,
        }
    }

    /// Parse an algorithm name, returning `None` for anything unrecognized.
    ///
    /// This is total: it never errors, it just reports non-support.
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(DigestAlgorithm::Sha256),
            "sha512" => Some(DigestAlgorithm::Sha512),
            "blake3" => Some(DigestAlgorithm::Blake3),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns true iff `s` names a supported algorithm. Total: never panics or errors.
pub fn is_supported(s: &str) -> bool {
    DigestAlgorithm::from_name(s).is_some()
}

/// Validates only the syntactic shape `alg:hex` (one colon, hex on the right),
/// without checking whether the algorithm is recognized or the hex length matches.
pub fn matches_pattern(s: &str) -> bool {
    DIGEST_SHAPE.is_match(s)
}

/// A parsed and validated digest: an algorithm plus its hex-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// The algorithm this digest was computed with.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// The lowercase hex-encoded digest value, without the `alg:` prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Parse a digest string of the form `alg:hex`.
    ///
    /// Fails if the string doesn't contain exactly one colon, the algorithm is
    /// unrecognized, or the hex portion's length doesn't match the algorithm
    /// (this also rejects nested prefixes like `sha256:sha256:...`, since the
    /// stray inner colon makes the split ambiguous).
    pub fn parse(s: &str) -> Result<Self, OciDistributionError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(OciDistributionError::InvalidDigest(s.to_string()));
        }
        let (alg_str, hex) = (parts[0], parts[1]);
        let algorithm = DigestAlgorithm::from_name(alg_str)
            .ok_or_else(|| OciDistributionError::InvalidDigest(s.to_string()))?;
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OciDistributionError::InvalidDigest(s.to_string()));
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_lowercase(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl TryFrom<&str> for Digest {
    type Error = OciDistributionError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = OciDistributionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Digest::parse(&s)
    }
}

/// Returns the algorithm a digest string uses, failing if the string is malformed.
pub fn from_digest(s: &str) -> Result<DigestAlgorithm, OciDistributionError> {
    Ok(Digest::parse(s)?.algorithm())
}

/// Compute the digest of an in-memory byte slice.
pub fn digest_bytes(alg: DigestAlgorithm, bytes: &[u8]) -> String {
    let hex = match alg {
        DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        DigestAlgorithm::Blake3 => blake3::hash(bytes).to_hex().to_string(),
    };
    format!("{}:{}", alg.as_str(), hex)
}

/// Compute the digest of a synchronous reader, streaming in fixed-size chunks
/// so the whole input is never buffered in memory.
pub fn digest_reader<R: Read>(alg: DigestAlgorithm, mut reader: R) -> std::io::Result<String> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let hex = match alg {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
        DigestAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
        DigestAlgorithm::Blake3 => {
            let mut hasher = Blake3Hasher::new();
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.finalize().to_hex().to_string()
        }
    };
    Ok(format!("{}:{}", alg.as_str(), hex))
}

/// Compute the digest of a file on disk, streaming rather than reading it whole.
pub fn digest_file(
    alg: DigestAlgorithm,
    path: impl AsRef<Path>,
) -> Result<String, OciDistributionError> {
    let file = std::fs::File::open(path.as_ref())
        .map_err(|e| OciDistributionError::IOFailure(e.into()))?;
    digest_reader(alg, file).map_err(|e| OciDistributionError::IOFailure(e.into()))
}

/// A streaming digest accumulator for use alongside chunked network reads
/// (e.g. folding over a `reqwest::Response::bytes_stream()`).
pub enum StreamingDigester {
    /// Accumulating a SHA-256 digest.
    Sha256(Box<Sha256>),
    /// Accumulating a SHA-512 digest.
    Sha512(Box<Sha512>),
    /// Accumulating a BLAKE3 digest.
    Blake3(Box<Blake3Hasher>),
}

impl StreamingDigester {
    /// Start a new streaming digest for the given algorithm.
    pub fn new(alg: DigestAlgorithm) -> Self {
        match alg {
            DigestAlgorithm::Sha256 => StreamingDigester::Sha256(Box::new(Sha256::new())),
            DigestAlgorithm::Sha512 => StreamingDigester::Sha512(Box::new(Sha512::new())),
            DigestAlgorithm::Blake3 => StreamingDigester::Blake3(Box::new(Blake3Hasher::new())),
        }
    }

    /// Fold another chunk of bytes into the running digest.
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            StreamingDigester::Sha256(h) => h.update(chunk),
            StreamingDigester::Sha512(h) => h.update(chunk),
            StreamingDigester::Blake3(h) => {
                h.update(chunk);
            }
        }
    }

    /// Finish and render the accumulated digest as `alg:hex`.
    pub fn finalize(self) -> String {
        match self {
            StreamingDigester::Sha256(h) => format!("sha256:{}", hex::encode(h.finalize())),
            StreamingDigester::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize())),
            StreamingDigester::Blake3(h) => format!("blake3:{}", h.finalize().to_hex()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sha256("sha256", 64)]
    #[case::sha512("sha512", 128)]
    #[case::blake3("blake3", 64)]
    fn algorithm_hex_len_matches_known_algorithms(#[case] name: &str, #[case] expected_len: usize) {
        let alg = DigestAlgorithm::from_name(name).expect("recognized algorithm");
        assert_eq!(alg.hex_len(), expected_len);
        assert!(is_supported(name));
    }

    #[test]
    fn digest_of_hello_matches_known_value() {
        assert_eq!(
            digest_bytes(DigestAlgorithm::Sha256, b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn digest_of_empty_json_matches_canonical_constant() {
        assert_eq!(
            digest_bytes(DigestAlgorithm::Sha256, EMPTY_JSON_BYTES),
            EMPTY_JSON_DIGEST
        );
    }

    #[test]
    fn parse_and_recompute_round_trip() {
        let computed = digest_bytes(DigestAlgorithm::Sha256, b"round trip me");
        let parsed = Digest::parse(&computed).expect("valid digest");
        assert_eq!(parsed.algorithm(), DigestAlgorithm::Sha256);
        assert_eq!(
            digest_bytes(parsed.algorithm(), b"round trip me"),
            computed
        );
    }

    #[test]
    fn rejects_nested_prefix() {
        Digest::parse("sha256:sha256:abcd").expect_err("nested prefix must be rejected");
    }

    #[test]
    fn rejects_unsupported_algorithm() {
        Digest::parse("md5:d41d8cd98f00b204e9800998ecf8427e").expect_err("md5 unsupported");
        assert!(!is_supported("md5"));
        assert!(is_supported("sha256"));
        assert!(is_supported("blake3"));
    }

    #[test]
    fn rejects_wrong_length_hex() {
        Digest::parse("sha256:abcd").expect_err("too short for sha256");
    }

    #[test]
    fn matches_pattern_checks_shape_only() {
        assert!(matches_pattern("sha256:abcdef0123456789"));
        assert!(matches_pattern("md5:deadbeef"));
        assert!(!matches_pattern("sha256"));
        assert!(!matches_pattern("sha256:"));
        assert!(!matches_pattern(":abcd"));
    }

    #[test]
    fn digest_file_streams_without_buffering_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello").unwrap();
        let got = digest_file(DigestAlgorithm::Sha256, &path).expect("digest file");
        assert_eq!(
            got,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn streaming_digester_matches_oneshot() {
        let mut d = StreamingDigester::new(DigestAlgorithm::Sha256);
        d.update(b"hel");
        d.update(b"lo");
        assert_eq!(
            d.finalize(),
            digest_bytes(DigestAlgorithm::Sha256, b"hello")
        );
    }
}

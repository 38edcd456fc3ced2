//! Error types for the chunk codec.

/// Errors that can occur while encoding or decoding a chunk.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Attempted to encode an empty chunk.
    #[error("cannot encode an empty chunk")]
    EmptyChunk,

    /// Reed-Solomon library failure.
    #[error("reed-solomon error: {0}")]
    ReedSolomon(#[from] reed_solomon_simd::Error),

    /// Fewer fragments than `data_frags` were available for decoding.
    #[error("not enough fragments: need {needed}, got {got}")]
    NotEnoughFrags {
        /// Fragments required (`k`).
        needed: usize,
        /// Fragments provided.
        got: usize,
    },

    /// The configuration asks for fragments this kernel cannot produce.
    #[error("unsupported coder configuration: {0}")]
    Unsupported(String),

    /// A provided fragment is inconsistent with the chunk's coding.
    #[error("bad fragment: {0}")]
    BadFragment(String),

    /// Compression or decompression failure.
    #[error("compression error: {0}")]
    Compress(#[from] std::io::Error),

    /// Encryption or decryption failure (bad key, nonce, or tag).
    #[error("cipher error")]
    Cipher,

    /// The chunk is missing cipher material its coder config requires.
    #[error("missing cipher key or iv for encrypted chunk")]
    MissingCipherState,

    /// Decoded plaintext does not match the recorded content digest.
    #[error("chunk digest mismatch after decode")]
    DigestMismatch,

    /// Decoded plaintext has the wrong length.
    #[error("decoded length {got} does not match chunk size {expected}")]
    LengthMismatch {
        /// Expected plaintext size.
        expected: usize,
        /// Actual decoded size.
        got: usize,
    },

    /// A worker task failed to run to completion.
    #[error("codec worker failed: {0}")]
    Worker(String),
}

#![forbid(unsafe_code)]

use hkdf::Hkdf;
use sha2::{Sha256, Sha384};

use crate::hash::HashAlgorithm;
use crate::{Error, Result};

/// HKDF-Extract: returns the pseudorandom key for `ikm` under `salt`.
pub fn hkdf_extract(alg: HashAlgorithm, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    match alg {
        HashAlgorithm::Sha256 => Hkdf::<Sha256>::extract(Some(salt), ikm).0.to_vec(),
        HashAlgorithm::Sha384 => Hkdf::<Sha384>::extract(Some(salt), ikm).0.to_vec(),
    }
}

/// HKDF-Expand: derives `out_len` bytes from `prk` with context `info`.
pub fn hkdf_expand(alg: HashAlgorithm, prk: &[u8], info: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; out_len];
    match alg {
        HashAlgorithm::Sha256 => Hkdf::<Sha256>::from_prk(prk)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .expand(info, &mut out)
            .map_err(|e| Error::Crypto(e.to_string()))?,
        HashAlgorithm::Sha384 => Hkdf::<Sha384>::from_prk(prk)
            .map_err(|e| Error::InvalidKey(e.to_string()))?
            .expand(info, &mut out)
            .map_err(|e| Error::Crypto(e.to_string()))?,
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn rfc5869_case_1() {
        let ikm = hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b");
        let salt = hex!("000102030405060708090a0b0c");
        let info = hex!("f0f1f2f3f4f5f6f7f8f9");

        let prk = hkdf_extract(HashAlgorithm::Sha256, &salt, &ikm);
        assert_eq!(
            prk,
            hex!("077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5")
        );

        let okm = hkdf_expand(HashAlgorithm::Sha256, &prk, &info, 42).expect("expand");
        assert_eq!(
            okm,
            hex!(
                "3cb25f25faacd57a90434f64d0362f2a"
                "2d2d0a90cf1a5a4c5db02d56ecc4c5bf"
                "34007208d5b887185865"
            )
        );
    }

    #[test]
    fn expand_rejects_oversized_output() {
        let prk = hkdf_extract(HashAlgorithm::Sha256, &[], b"ikm");
        // 255 * HashLen is the HKDF ceiling
        assert!(hkdf_expand(HashAlgorithm::Sha256, &prk, b"", 255 * 32 + 1).is_err());
    }
}

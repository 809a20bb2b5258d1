use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use std::io::ErrorKind;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;

// Only for test purpose.
pub fn default_salt() -> [u8; SCRAMBLE_SIZE] {
    let bs = ";X,po_k}>o6^Wz!/kM}N".as_bytes();
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        salt[i] = bs[i];
        if salt[i] == b'\0' || salt[i] == b'$' {
            salt[i] += 1;
        }
    }
    salt
}

fn val(c: u8, idx: usize) -> Result<u8, std::io::Error> {
    match c {
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'0'..=b'9' => Ok(c - b'0'),
        _ => Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("Invalid hex character {}", idx),
        )),
    }
}

pub fn hex_string_decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, std::io::Error> {
    let data_ref = data.as_ref();
    if data_ref.len() % 2 != 0 {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "Input hex string's length needs to be even, as two digits correspond to one byte.",
        ));
    }

    data_ref
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            Ok::<u8, std::io::Error>(val(pair[0], 2 * i)? << 4 | val(pair[1], 2 * i + 1)?)
        })
        .collect()
}

/// Generate a random string user ASCII but avoid separator character.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

/// Computes the `caching_sha2_password` fast-auth scramble a client is
/// expected to send: `XOR(SHA256(password), SHA256(SHA256(SHA256(password)), nonce))`.
/// See the scramble derivation in
/// `mysql_native_password`'s sibling plugin, `caching_sha2_password`,
/// documented at
/// <https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html>.
pub fn scramble_caching_sha2_password(password: &[u8], nonce: &[u8]) -> [u8; 32] {
    let stage1 = sha256_1(password);
    let stage2 = sha256_1(stage1);
    let stage3 = sha256_2(stage2, nonce);
    xor(stage1, stage3)
}

/// Computes the `mysql_native_password` scramble used when dialing
/// upstream as a MySQL client: `XOR(SHA1(password), SHA1(seed ++ SHA1(SHA1(password))))`.
/// An empty password scrambles to an empty response, per the plugin's own
/// convention (no bytes are sent at all).
/// See <https://mariadb.com/kb/en/connection/#mysql_native_password-plugin>.
pub fn scramble_mysql_native_password(password: &[u8], seed: &[u8]) -> [u8; 20] {
    let stage1 = sha1_1(password);
    let stage2 = sha1_1(stage1);
    let stage3 = sha1_2(seed, stage2);
    xor(stage1, stage3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_scramble_is_deterministic() {
        let seed = default_salt();
        let a = scramble_mysql_native_password(b"s3cr3t", &seed);
        let b = scramble_mysql_native_password(b"s3cr3t", &seed);
        assert_eq!(a, b);
    }

    #[test]
    fn native_scramble_differs_per_password() {
        let seed = default_salt();
        let a = scramble_mysql_native_password(b"s3cr3t", &seed);
        let b = scramble_mysql_native_password(b"other", &seed);
        assert_ne!(a, b);
    }

    #[test]
    fn scramble_is_deterministic() {
        let nonce = default_salt();
        let a = scramble_caching_sha2_password(b"s3cr3t", &nonce);
        let b = scramble_caching_sha2_password(b"s3cr3t", &nonce);
        assert_eq!(a, b);
    }

    #[test]
    fn scramble_differs_per_password() {
        let nonce = default_salt();
        let a = scramble_caching_sha2_password(b"s3cr3t", &nonce);
        let b = scramble_caching_sha2_password(b"other", &nonce);
        assert_ne!(a, b);
    }
}

//! Password digest expected by the file-hosting provider:
//! lowercase hex `SHA1(MD5Crypt(password, salt))`.

use sha1::{Digest, Sha1};

const MAGIC: &str = "$1$";
const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const MAX_SALT_LEN: usize = 8;
const ROUNDS: usize = 1000;

/// Digest sent as the password on login
pub fn password_digest(password: &str, salt: &str) -> String {
    let crypted = md5crypt(password.as_bytes(), salt.as_bytes());
    hex::encode(Sha1::digest(crypted.as_bytes()))
}

/// FreeBSD MD5-crypt, `$1$<salt>$<hash>`
pub fn md5crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = salt.strip_prefix(MAGIC.as_bytes()).unwrap_or(salt);
    let salt_end = salt
        .iter()
        .take(MAX_SALT_LEN)
        .position(|&b| b == b'$')
        .unwrap_or(salt.len().min(MAX_SALT_LEN));
    let salt = &salt[..salt_end];

    let mut ctx = md5::Context::new();
    ctx.consume(password);
    ctx.consume(MAGIC.as_bytes());
    ctx.consume(salt);

    let mut alt = md5::Context::new();
    alt.consume(password);
    alt.consume(salt);
    alt.consume(password);
    let alt = alt.compute();

    let mut remaining = password.len();
    while remaining > 0 {
        let take = remaining.min(16);
        ctx.consume(&alt.0[..take]);
        remaining -= take;
    }

    let mut bits = password.len();
    while bits > 0 {
        if bits & 1 == 1 {
            ctx.consume([0u8]);
        } else {
            ctx.consume(&password[..1]);
        }
        bits >>= 1;
    }

    let mut digest = ctx.compute().0;

    for round in 0..ROUNDS {
        let mut ctx = md5::Context::new();
        if round & 1 == 1 {
            ctx.consume(password);
        } else {
            ctx.consume(digest);
        }
        if round % 3 != 0 {
            ctx.consume(salt);
        }
        if round % 7 != 0 {
            ctx.consume(password);
        }
        if round & 1 == 1 {
            ctx.consume(digest);
        } else {
            ctx.consume(password);
        }
        digest = ctx.compute().0;
    }

    let mut out = String::with_capacity(MAGIC.len() + salt.len() + 1 + 22);
    out.push_str(MAGIC);
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');

    let groups = [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)];
    for (a, b, c) in groups {
        let value =
            (u32::from(digest[a]) << 16) | (u32::from(digest[b]) << 8) | u32::from(digest[c]);
        encode64(&mut out, value, 4);
    }
    encode64(&mut out, u32::from(digest[11]), 2);

    out
}

fn encode64(out: &mut String, mut value: u32, chars: usize) {
    for _ in 0..chars {
        out.push(char::from(ITOA64[(value & 0x3f) as usize]));
        value >>= 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5crypt_known_vectors() {
        assert_eq!(
            md5crypt(b"password", b"saltsalt"),
            "$1$saltsalt$qjXMvbEw8oaL.CzflDtaK/"
        );
        assert_eq!(md5crypt(b"hunter2", b"abc"), "$1$abc$9dV135Rc3U8Xbm2DxadgF0");
    }

    #[test]
    fn test_salt_is_truncated_and_magic_stripped() {
        assert_eq!(
            md5crypt(b"password", b"$1$saltsaltEXTRA"),
            md5crypt(b"password", b"saltsalt")
        );
    }

    #[test]
    fn test_password_digest() {
        assert_eq!(
            password_digest("password", "saltsalt"),
            "8f3315e7ab76ef346454e2f25a8560d66c593dc3"
        );
        assert_eq!(
            password_digest("hunter2", "abc"),
            "b1ef635d01eb89cc3ce4adf1e5268746ae0edd4e"
        );
    }
}

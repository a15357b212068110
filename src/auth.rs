use sha1::{Digest, Sha1};

pub fn stage2_from_password(password: &[u8]) -> [u8; 20] {
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    stage2.into()
}

/// Verify the mysql_native_password token (auth_data) against the stored stage2 hash.
///
/// Stored form is SHA1(SHA1(password)) (20 bytes).
pub fn verify_native_password_token(
    salt: &[u8],
    stored_stage2: &[u8; 20],
    auth_data: &[u8],
) -> bool {
    if auth_data.len() != 20 {
        return false;
    }

    // token = stage1 XOR SHA1(salt + stage2)
    // => stage1 = token XOR SHA1(salt + stage2)
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stored_stage2);
    let salt_stage2_hash: [u8; 20] = hasher.finalize().into();

    let mut stage1 = [0u8; 20];
    for (i, byte) in stage1.iter_mut().enumerate() {
        *byte = auth_data[i] ^ salt_stage2_hash[i];
    }

    let stage2_check: [u8; 20] = Sha1::digest(stage1).into();
    stage2_check == *stored_stage2
}

/// Account that may connect to the `serve` listener.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    /// None for an empty password.
    stage2: Option<[u8; 20]>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: &str) -> Self {
        Self {
            user: user.into(),
            stage2: (!password.is_empty()).then(|| stage2_from_password(password.as_bytes())),
        }
    }

    pub fn verify(&self, user: &[u8], salt: &[u8], auth_data: &[u8]) -> bool {
        if user != self.user.as_bytes() {
            return false;
        }
        match &self.stage2 {
            // Empty password is represented by empty auth_data.
            None => auth_data.is_empty(),
            Some(stage2) => verify_native_password_token(salt, stage2, auth_data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Client side of mysql_native_password.
    fn scramble(password: &[u8], salt: &[u8]) -> Vec<u8> {
        let stage1: [u8; 20] = Sha1::digest(password).into();
        let stage2 = stage2_from_password(password);
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(stage2);
        let mask: [u8; 20] = hasher.finalize().into();
        stage1.iter().zip(mask).map(|(a, b)| a ^ b).collect()
    }

    #[test]
    fn native_password_round_trip() {
        let salt = b"12345678901234567890";
        let creds = Credentials::new("root", "secret");
        assert!(creds.verify(b"root", salt, &scramble(b"secret", salt)));
        assert!(!creds.verify(b"root", salt, &scramble(b"wrong", salt)));
        assert!(!creds.verify(b"admin", salt, &scramble(b"secret", salt)));
        assert!(!creds.verify(b"root", salt, &[]));
    }

    #[test]
    fn empty_password_needs_empty_token() {
        let creds = Credentials::new("root", "");
        assert!(creds.verify(b"root", b"salt", &[]));
        assert!(!creds.verify(b"root", b"salt", &[1; 20]));
    }
}

//! CURVE certificates for overlay peers.
//!
//! A certificate wraps a Z85-encoded CURVE keypair plus free-form string
//! metadata (role, hostname, generation time, ...) and a small textual file
//! format so certs can be generated once and shared across a fleet.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

const Z85_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to read cert file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cert file {path} is group- or world-readable, refusing to load secret key")]
    Permissions { path: String },
    #[error("empty certificate input")]
    Empty,
    #[error("missing [curve] section")]
    MissingCurveSection,
    #[error("unknown section '{0}'")]
    UnknownSection(String),
    #[error("unterminated quoted value on line {0}")]
    UnterminatedQuote(usize),
    #[error("key longer than {Z85_LEN} characters")]
    KeyTooLong,
    #[error("value is not valid Z85: '{0}'")]
    InvalidZ85(String),
    #[error("secret key does not match given public key")]
    KeyMismatch,
    #[error("certificate has no secret key, cannot apply to a server-mode socket")]
    PublicOnly,
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
}

fn is_z85(s: &str) -> bool {
    s.len() == Z85_LEN
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b".-:+=^!/*?&<>()[]{}@%$#".contains(b as char)
        })
}

fn validate_z85(s: &str) -> Result<(), CertError> {
    if s.len() > Z85_LEN {
        return Err(CertError::KeyTooLong);
    }
    if !is_z85(s) {
        return Err(CertError::InvalidZ85(s.to_string()));
    }
    Ok(())
}

/// A CURVE keypair (possibly public-only) plus metadata, in the textual
/// format described by the overlay's certificate section.
#[derive(Debug, Clone, Default)]
pub struct Cert {
    metadata: BTreeMap<String, String>,
    public_key: Option<String>,
    secret_key: Option<String>,
}

impl Cert {
    /// Generate a fresh keypair.
    pub fn create() -> Result<Self, CertError> {
        let (public, secret) = zmq::curve_keypair()?;
        Ok(Self {
            metadata: BTreeMap::new(),
            public_key: Some(public),
            secret_key: Some(secret),
        })
    }

    /// Build a cert from an existing (possibly partial) keypair.
    ///
    /// `secret` without `public` is rejected by the caller constructing the
    /// pair from a decoded secret (public-only certs never carry a secret).
    /// If both are present, the secret must decode to the given public key.
    pub fn create_from(public: Option<&str>, secret: Option<&str>) -> Result<Self, CertError> {
        if let Some(p) = public {
            validate_z85(p)?;
        }
        if let Some(s) = secret {
            validate_z85(s)?;
        }
        if let (Some(p), Some(s)) = (public, secret) {
            let derived = zmq::curve_public(s)?;
            if derived != p {
                return Err(CertError::KeyMismatch);
            }
        }
        Ok(Self {
            metadata: BTreeMap::new(),
            public_key: public.map(str::to_string),
            secret_key: secret.map(str::to_string),
        })
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn secret_key(&self) -> Option<&str> {
        self.secret_key.as_deref()
    }

    pub fn meta_get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn meta_set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Configure a transport socket to use this keypair.
    ///
    /// Fails if this cert has no secret key: a public-only cert represents
    /// a remote peer and cannot drive a local socket.
    pub fn apply(&self, socket: &zmq::Socket) -> Result<(), CertError> {
        let secret = self.secret_key.as_deref().ok_or(CertError::PublicOnly)?;
        let public = self
            .public_key
            .as_deref()
            .ok_or(CertError::PublicOnly)?;
        socket.set_curve_secretkey(secret.as_bytes())?;
        socket.set_curve_publickey(public.as_bytes())?;
        Ok(())
    }

    /// True iff both public and secret strings match (missing == missing).
    pub fn equal(a: &Cert, b: &Cert) -> bool {
        a.public_key == b.public_key && a.secret_key == b.secret_key
    }

    /// Serialize to the textual cert format.
    pub fn to_string_repr(&self) -> String {
        let mut out = String::new();
        out.push_str("metadata\n");
        for (k, v) in &self.metadata {
            let _ = writeln!(out, "    {k} = \"{v}\"");
        }
        out.push_str("curve\n");
        if let Some(p) = &self.public_key {
            let _ = writeln!(out, "    public-key = \"{p}\"");
        }
        if let Some(s) = &self.secret_key {
            let _ = writeln!(out, "    secret-key = \"{s}\"");
        }
        out
    }

    /// Parse the textual cert format.
    pub fn from_str_repr(input: &str) -> Result<Self, CertError> {
        if input.trim().is_empty() {
            return Err(CertError::Empty);
        }

        let mut metadata = BTreeMap::new();
        let mut public_key = None;
        let mut secret_key = None;
        let mut section: Option<&str> = None;
        let mut saw_curve_section = false;

        for (lineno, raw_line) in input.lines().enumerate() {
            let lineno = lineno + 1;
            if raw_line.trim().is_empty() || raw_line.trim_start().starts_with('#') {
                continue;
            }

            let indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');
            let line = raw_line.trim();

            if !indented {
                match line {
                    "metadata" => section = Some("metadata"),
                    "curve" => {
                        section = Some("curve");
                        saw_curve_section = true;
                    }
                    other => return Err(CertError::UnknownSection(other.to_string())),
                }
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let value = if value.starts_with('"') {
                if !value.ends_with('"') || value.len() < 2 {
                    return Err(CertError::UnterminatedQuote(lineno));
                }
                &value[1..value.len() - 1]
            } else {
                value
            };

            match section {
                Some("metadata") => {
                    metadata.insert(key.to_string(), value.to_string());
                }
                Some("curve") => match key {
                    "public-key" => {
                        validate_z85(value)?;
                        public_key = Some(value.to_string());
                    }
                    "secret-key" => {
                        validate_z85(value)?;
                        secret_key = Some(value.to_string());
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        if !saw_curve_section {
            return Err(CertError::MissingCurveSection);
        }
        if let (Some(p), Some(s)) = (&public_key, &secret_key) {
            let derived = zmq::curve_public(s)?;
            if &derived != p {
                return Err(CertError::KeyMismatch);
            }
        }

        Ok(Self {
            metadata,
            public_key,
            secret_key,
        })
    }

    /// Load a cert from disk, enforcing that secret-holding files are not
    /// group- or world-readable.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, CertError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = fs::metadata(path).map_err(|source| CertError::Io {
                path: path_str.clone(),
                source,
            })?;
            if meta.permissions().mode() & 0o077 != 0 {
                return Err(CertError::Permissions { path: path_str });
            }
        }

        let contents = fs::read_to_string(path).map_err(|source| CertError::Io {
            path: path_str,
            source,
        })?;
        Self::from_str_repr(&contents)
    }

    /// Write the cert to disk. The file is created with mode 0600 when a
    /// secret key is present.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), CertError> {
        let path = path.as_ref();
        let contents = self.to_string_repr();
        fs::write(path, contents).map_err(|source| CertError::Io {
            path: path.display().to_string(),
            source,
        })?;

        #[cfg(unix)]
        if self.secret_key.is_some() {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).map_err(|source| CertError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_yields_valid_z85_keys() {
        let cert = Cert::create().unwrap();
        assert!(is_z85(cert.public_key().unwrap()));
        assert!(is_z85(cert.secret_key().unwrap()));
    }

    #[test]
    fn write_then_read_is_idempotent() {
        let mut cert = Cert::create().unwrap();
        cert.meta_set("role", "child");
        cert.meta_set("hostname", "node3");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert");
        cert.write(&path).unwrap();

        let loaded = Cert::read(&path).unwrap();
        assert!(Cert::equal(&cert, &loaded));
        assert_eq!(loaded.meta_get("role"), Some("child"));
        assert_eq!(loaded.meta_get("hostname"), Some("node3"));
    }

    #[test]
    fn public_only_cert_round_trips() {
        let cert = Cert::create().unwrap();
        let pub_only = Cert::create_from(cert.public_key(), None).unwrap();
        assert_eq!(pub_only.secret_key(), None);

        let text = pub_only.to_string_repr();
        let parsed = Cert::from_str_repr(&text).unwrap();
        assert!(Cert::equal(&pub_only, &parsed));
    }

    #[test]
    fn mismatched_keypair_is_rejected() {
        let a = Cert::create().unwrap();
        let b = Cert::create().unwrap();
        let err = Cert::create_from(a.public_key(), b.secret_key()).unwrap_err();
        assert!(matches!(err, CertError::KeyMismatch));
    }

    #[test]
    fn missing_curve_section_is_rejected() {
        let err = Cert::from_str_repr("metadata\n    role = \"test\"\n").unwrap_err();
        assert!(matches!(err, CertError::MissingCurveSection));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = Cert::from_str_repr("   \n").unwrap_err();
        assert!(matches!(err, CertError::Empty));
    }

    #[test]
    fn unknown_section_is_rejected() {
        let err = Cert::from_str_repr("bogus\n    x = \"1\"\ncurve\n").unwrap_err();
        assert!(matches!(err, CertError::UnknownSection(_)));
    }

    #[test]
    fn apply_requires_secret_key() {
        let cert = Cert::create().unwrap();
        let pub_only = Cert::create_from(cert.public_key(), None).unwrap();
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::DEALER).unwrap();
        let err = pub_only.apply(&socket).unwrap_err();
        assert!(matches!(err, CertError::PublicOnly));
    }

    #[test]
    fn apply_with_secret_configures_socket() {
        let cert = Cert::create().unwrap();
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::ROUTER).unwrap();
        cert.apply(&socket).unwrap();
    }
}

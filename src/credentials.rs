//! Device authentication: connection strings, SAS tokens, TLS identity.
//!
//! A device authenticates either with a shared access key (the SAS token
//! becomes the MQTT password) or with an X.509 client certificate
//! presented during the TLS handshake.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::Sha256;
use url::form_urlencoded;

use crate::error::{Result, TransportError};

/// X.509 device identity presented on TLS client-auth challenge.
pub struct X509Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for X509Identity {
    fn clone(&self) -> Self {
        X509Identity {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Identity")
            .field("cert_chain", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Everything required to authenticate one device session.
///
/// Immutable once parsed.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    hostname: String,
    device_id: String,
    shared_access_key: String,
    shared_access_key_name: String,
    x509: Option<X509Identity>,

    // test override for the wall clock
    now: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Parses a `K=V;` device connection string.
    ///
    /// Recognized keys are `HostName`, `DeviceId`, `SharedAccessKey` and
    /// `SharedAccessKeyName`; unknown keys are ignored. Missing required
    /// values are not an error here, they surface when `sas` is called.
    pub fn from_connection_string(cs: &str) -> Result<Self> {
        let chunks: Vec<&str> = cs.split(';').collect();
        if chunks.len() != 3 && chunks.len() != 4 {
            return Err(TransportError::MalformedConnectionString);
        }

        let mut creds = Credentials::default();
        for chunk in chunks {
            let (key, value) = chunk
                .split_once('=')
                .ok_or(TransportError::MalformedConnectionString)?;
            match key {
                "HostName" => creds.hostname = value.to_string(),
                "DeviceId" => creds.device_id = value.to_string(),
                "SharedAccessKey" => creds.shared_access_key = value.to_string(),
                "SharedAccessKeyName" => creds.shared_access_key_name = value.to_string(),
                _ => {}
            }
        }
        Ok(creds)
    }

    /// Credentials for X.509 authentication with in-memory identity
    /// material.
    pub fn from_x509(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Credentials {
            hostname: hostname.into(),
            device_id: device_id.into(),
            x509: Some(X509Identity { cert_chain, key }),
            ..Default::default()
        }
    }

    /// Credentials for X.509 authentication, loading the certificate
    /// chain and private key from PEM files.
    pub fn from_x509_files(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        cert_path: &str,
        key_path: &str,
    ) -> Result<Self> {
        let mut reader = BufReader::new(File::open(cert_path).map_err(TransportError::Io)?);
        let cert_chain = rustls_pemfile::certs(&mut reader)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(TransportError::Io)?;

        let mut reader = BufReader::new(File::open(key_path).map_err(TransportError::Io)?);
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(TransportError::Io)?
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no private key found in PEM file",
                ))
            })?;

        Ok(Self::from_x509(hostname, device_id, cert_chain, key))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether this device authenticates with a shared access key.
    pub fn is_sas(&self) -> bool {
        self.x509.is_none()
    }

    /// Mints a SAS token valid for `ttl`, used as the MQTT password.
    ///
    /// The signed string is `"<escaped-hostname>\n<expiry-seconds>"`,
    /// HMAC-SHA256 signed with the base64-decoded key. `skn` is always
    /// present, empty when no policy name is set.
    pub fn sas(&self, ttl: Duration) -> Result<String> {
        if self.hostname.is_empty() {
            return Err(TransportError::MissingHostname);
        }
        if self.shared_access_key.is_empty() {
            return Err(TransportError::MissingKey);
        }

        let sr = query_escape(&self.hostname);
        let now = self.now.unwrap_or_else(Utc::now);
        let se = now.timestamp() + ttl.as_secs() as i64;

        let key = BASE64
            .decode(&self.shared_access_key)
            .map_err(TransportError::InvalidKey)?;

        let mut mac =
            Hmac::<Sha256>::new_from_slice(&key).expect("HMAC accepts keys of any length");
        mac.update(format!("{sr}\n{se}").as_bytes());
        let sig = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            sr,
            query_escape(&sig),
            query_escape(&se.to_string()),
            query_escape(&self.shared_access_key_name),
        ))
    }

    /// TLS client configuration for the hub connection.
    ///
    /// Web PKI trust roots, TLS 1.2 minimum, and the device certificate
    /// presented on challenge when X.509 auth is in use.
    pub fn tls_config(&self) -> Result<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        match &self.x509 {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
                .map_err(TransportError::Tls),
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

/// URL query escaping as used in topic property bags and SAS fields.
pub(crate) fn query_escape(s: &str) -> String {
    form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

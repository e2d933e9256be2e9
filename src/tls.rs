//! Building the rustls client configuration from the frozen [`Config`].
//!
//! Everything here runs once, on the caller's thread, before the reactor is
//! involved; a failure is fatal for the client and reconnect never engages.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

use crate::config::{Config, ConfigError, TrustDecider};

pub(crate) fn client_config(config: &Config) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| ConfigError::Tls(err.to_string()))?;
    let builder = match &config.trust {
        Some(decider) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeciderVerifier {
                decider: decider.clone(),
                provider,
            })),
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots)
        }
    };
    let client = match (&config.ssl_key_cert_chain, &config.ssl_key) {
        (Some(chain_path), Some(key_path)) => {
            let chain = load_cert_chain(chain_path)?;
            let key = load_key(key_path, config.ssl_key_password.as_deref())?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|err| ConfigError::Tls(err.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(client))
}

/// Adapter handing the full presented chain (leaf first) to the
/// caller-supplied [`TrustDecider`]. Signature checks stay with the
/// provider; only chain trust is delegated.
struct DeciderVerifier {
    decider: Arc<dyn TrustDecider>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for DeciderVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeciderVerifier")
    }
}

impl ServerCertVerifier for DeciderVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());
        if self.decider.verify(&chain) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let data = read(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &data[..])
        .collect::<Result<_, _>>()
        .map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::EmptyCertChain(path.to_owned()));
    }
    Ok(certs)
}

fn load_key(path: &Path, password: Option<&str>) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let data = read(path)?;
    if let Some(password) = password {
        if let Some(key) = decrypt_key(&data, password)? {
            return Ok(key);
        }
        // Password supplied for a key that turned out to be unencrypted.
    }
    rustls_pemfile::private_key(&mut &data[..])
        .map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?
        .ok_or_else(|| ConfigError::MissingKey(path.to_owned()))
}

/// Decrypt an `ENCRYPTED PRIVATE KEY` PEM block (PKCS#8 + PBES2). Returns
/// `Ok(None)` when the file holds some other kind of key.
fn decrypt_key(
    data: &[u8],
    password: &str,
) -> Result<Option<PrivateKeyDer<'static>>, ConfigError> {
    let pem = match std::str::from_utf8(data) {
        Ok(pem) => pem,
        Err(_) => return Ok(None),
    };
    let (label, doc) = pkcs8::SecretDocument::from_pem(pem)
        .map_err(|err| ConfigError::KeyDecrypt(err.to_string()))?;
    if label != "ENCRYPTED PRIVATE KEY" {
        return Ok(None);
    }
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
        .map_err(|err| ConfigError::KeyDecrypt(err.to_string()))?;
    let decrypted = info
        .decrypt(password)
        .map_err(|err| ConfigError::KeyDecrypt(err.to_string()))?;
    Ok(Some(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        decrypted.as_bytes().to_vec(),
    ))))
}

fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::sync::Mutex;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["irc.example.net".to_owned()]).unwrap()
    }

    #[test]
    fn builds_with_client_cert_material() {
        let identity = self_signed();
        let cert = write_temp(&identity.cert.pem());
        let key = write_temp(&identity.key_pair.serialize_pem());
        let config = Config::builder("irc.example.net", 6697)
            .nick("kelpie")
            .ssl(true)
            .ssl_client_cert(cert.path(), key.path(), None)
            .build()
            .unwrap();
        client_config(&config).unwrap();
    }

    #[test]
    fn missing_material_is_fatal() {
        let config = Config::builder("irc.example.net", 6697)
            .nick("kelpie")
            .ssl(true)
            .ssl_client_cert("/nonexistent/cert.pem", "/nonexistent/key.pem", None)
            .build()
            .unwrap();
        assert_matches!(client_config(&config), Err(ConfigError::Io { .. }));
    }

    #[test]
    fn cert_file_without_certs_is_fatal() {
        let cert = write_temp("not a pem at all");
        let identity = self_signed();
        let key = write_temp(&identity.key_pair.serialize_pem());
        let config = Config::builder("irc.example.net", 6697)
            .nick("kelpie")
            .ssl(true)
            .ssl_client_cert(cert.path(), key.path(), None)
            .build()
            .unwrap();
        assert_matches!(client_config(&config), Err(ConfigError::EmptyCertChain(_)));
    }

    #[test]
    fn decider_sees_full_chain_and_can_reject() {
        struct Recording {
            lengths: Mutex<Vec<usize>>,
            accept: bool,
        }
        impl TrustDecider for Recording {
            fn verify(&self, chain: &[CertificateDer<'_>]) -> bool {
                self.lengths.lock().unwrap().push(chain.len());
                self.accept
            }
        }

        let identity = self_signed();
        let leaf = identity.cert.der().clone();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let decider = Arc::new(Recording {
            lengths: Mutex::new(Vec::new()),
            accept: false,
        });
        let verifier = DeciderVerifier {
            decider: decider.clone(),
            provider,
        };
        let name = ServerName::try_from("irc.example.net").unwrap();
        let result = verifier.verify_server_cert(&leaf, &[], &name, &[], UnixTime::now());
        assert_matches!(result, Err(TlsError::InvalidCertificate(_)));
        assert_eq!(*decider.lengths.lock().unwrap(), vec![1]);
    }
}

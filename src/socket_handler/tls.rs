// Copyright (c) 2026 The Hearth developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::mem;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use rustls::server::ClientHello;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::Certificate;
use rustls::PrivateKey;
use rustls::ServerConfig;
use rustls::ServerConnection;

use crate::socket_handler::{PrependedStream, SocketHandler, Update, UpdateResult};

/// Configuration for HTTPS handling.
///
/// This struct internally contains `Arc`s, which means that you can clone
/// it for a cheap cost.
///
/// The certificate store can be updated at runtime. Certificates can be
/// added or removed while the server is running; this only affects new
/// connections.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<ServerConfig>,
    certificates: Arc<Mutex<HashMap<String, Arc<CertifiedKey>>>>,
}

// Picks the certificate matching the hostname the ClientHello carries,
// before the handshake proceeds.
struct SniResolver {
    certificates: Arc<Mutex<HashMap<String, Arc<CertifiedKey>>>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        let certificates = self.certificates.lock().unwrap();
        certificates.get(server_name).cloned()
    }
}

impl TlsConfig {
    /// Builds a new configuration. You should do this at initialization
    /// only.
    ///
    /// Once the configuration is created, you should add certificates to
    /// it. Otherwise nobody will be able to connect.
    pub fn new() -> TlsConfig {
        let certificates: Arc<Mutex<HashMap<String, Arc<CertifiedKey>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SniResolver {
                certificates: certificates.clone(),
            }));

        TlsConfig {
            config: Arc::new(config),
            certificates,
        }
    }

    /// Sets the certificate of a domain name. The certificate chain and
    /// the private key are parsed from PEM files.
    ///
    /// Replaces the existing certificate for this domain name if one has
    /// been set earlier.
    pub fn set_certificate_from_pem<S, Pu, Pr>(
        &self,
        domain_name: S,
        cert_pem: Pu,
        key_pem: Pr,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    where
        S: Into<String>,
        Pu: AsRef<Path>,
        Pr: AsRef<Path>,
    {
        let chain = load_certificates(cert_pem)?;
        let key = load_private_key(key_pem)?;
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|_| String::from("unsupported private key type"))?;

        let mut certificates = self.certificates.lock().unwrap();
        certificates.insert(
            domain_name.into(),
            Arc::new(CertifiedKey::new(chain, signing_key)),
        );
        Ok(())
    }

    /// Removes the certificate of a domain name.
    pub fn remove_certificate(&self, domain_name: &str) {
        let mut certificates = self.certificates.lock().unwrap();
        certificates.remove(domain_name);
    }

    pub(crate) fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig::new()
    }
}

/// Handles the processing of a client connection through TLS.
///
/// This struct only performs the encoding and decoding; the actual HTTP
/// handling is performed by the inner handler.
pub(crate) struct TlsHandler<H> {
    handler: H,
    // Becomes `None` after the session has been handed over to an upgrade.
    session: Option<ServerConnection>,
    // The update object to communicate with the inner handler.
    handler_update: Update,
}

impl<H> TlsHandler<H> {
    pub fn new(config: &TlsConfig, inner: H) -> Result<TlsHandler<H>, rustls::Error> {
        Ok(TlsHandler {
            handler: inner,
            session: Some(ServerConnection::new(config.server_config())?),
            handler_update: Update::empty(),
        })
    }
}

// A TLS-level failure closes the connection without any HTTP response.
fn abort(update: &mut Update) -> UpdateResult {
    update.pending_write_buffer.clear();
    UpdateResult {
        registration: None,
        close_read: true,
        write_flush_suggested: false,
        upgrade: None,
    }
}

impl<H> SocketHandler for TlsHandler<H>
where
    H: SocketHandler,
{
    fn update(&mut self, update: &mut Update) -> UpdateResult {
        let session = match self.session {
            Some(ref mut session) => session,
            // The socket already belongs to an upgrade handler.
            None => return UpdateResult::idle(),
        };

        // Feed the ciphertext to the session, decrypting as we go so its
        // internal buffers never fill up.
        let mut tls_eof = false;
        let ciphertext = mem::replace(&mut update.pending_read_buffer, Vec::new());
        let mut input = &ciphertext[..];
        while !input.is_empty() {
            match session.read_tls(&mut input) {
                Ok(0) => break,
                Ok(_) => {
                    if session.process_new_packets().is_err() {
                        return abort(update);
                    }
                    match drain_plaintext(session, &mut self.handler_update.pending_read_buffer) {
                        Ok(clean_close) => tls_eof = tls_eof || clean_close,
                        Err(_) => return abort(update),
                    }
                }
                Err(_) => return abort(update),
            }
        }
        // read_tls can stop short; keep what it didn't take for next time.
        if !input.is_empty() {
            update.pending_read_buffer = input.to_vec();
        }

        self.handler_update.eof = update.eof || tls_eof;

        // Let the inner handler work on the plaintext.
        let mut result = self.handler.update(&mut self.handler_update);

        // Encrypt whatever it produced.
        if !self.handler_update.pending_write_buffer.is_empty() {
            if session
                .writer()
                .write_all(&self.handler_update.pending_write_buffer)
                .is_err()
            {
                return abort(update);
            }
            self.handler_update.pending_write_buffer.clear();
        }

        // And move the ciphertext out. Writing into a Vec cannot fail.
        while session.wants_write() {
            if session.write_tls(&mut update.pending_write_buffer).is_err() {
                return abort(update);
            }
        }

        // A protocol switch must hand over the *decrypted* stream: wrap
        // the raw socket in the session, with any plaintext the inner
        // handler didn't consume put back in front.
        if let Some(inner_handoff) = result.upgrade.take() {
            let session = self.session.take().unwrap();
            let leftover = mem::replace(&mut self.handler_update.pending_read_buffer, Vec::new());
            result.upgrade = Some(Box::new(move |raw| {
                let tls_stream = rustls::StreamOwned::new(session, raw);
                inner_handoff(Box::new(PrependedStream::new(leftover, tls_stream)));
            }));
        }

        result
    }

    fn is_idle(&self) -> bool {
        self.handler.is_idle()
    }
}

// Moves decrypted bytes out of the session. Returns true when the peer
// sent a clean TLS close.
fn drain_plaintext(session: &mut ServerConnection, out: &mut Vec<u8>) -> std::io::Result<bool> {
    let mut chunk = [0u8; 4096];
    loop {
        match session.reader().read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

// Load a certificate chain from a PEM file.
fn load_certificates<P>(path: P) -> Result<Vec<Certificate>, Box<dyn Error + Send + Sync>>
where
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|_| String::from("certificate PEM file is invalid"))?;
    if certs.is_empty() {
        return Err(String::from("certificate PEM file contains no certificate").into());
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

// Load a private key from a PEM file. Both PKCS#8 and RSA keys are
// accepted.
fn load_private_key<P>(path: P) -> Result<PrivateKey, Box<dyn Error + Send + Sync>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let mut pkcs8_keys = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|_| String::from("private key PEM file is invalid"))?
    };

    if !pkcs8_keys.is_empty() {
        return Ok(PrivateKey(pkcs8_keys.remove(0)));
    }

    let mut rsa_keys = {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::rsa_private_keys(&mut reader)
            .map_err(|_| String::from("private key PEM file is invalid"))?
    };

    if !rsa_keys.is_empty() {
        return Ok(PrivateKey(rsa_keys.remove(0)));
    }

    Err(String::from("private key PEM file contains no key").into())
}

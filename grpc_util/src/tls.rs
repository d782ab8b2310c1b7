// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

///
/// TLS material for a client channel: PEM buffers, as read from the files named by the
/// `TLS_CA_CERT`, `TLS_CLIENT_CERT` and `TLS_CLIENT_KEY` environment variables. Client
/// certificate and key must be provided together.
///
#[derive(Default, Clone)]
pub struct Config {
    pub root_ca_cert: Option<Vec<u8>>,
    pub mtls: Option<MtlsConfig>,
}

#[derive(Clone)]
pub struct MtlsConfig {
    /// PEM bytes of the certificate chain used for mTLS.
    pub cert_chain: Vec<u8>,
    /// PEM bytes of the private key used for mTLS.
    pub key: Vec<u8>,
}

impl Config {
    pub fn new<Buf: AsRef<[u8]>>(
        root_ca_cert: Option<Buf>,
        mtls: Option<(Buf, Buf)>,
    ) -> Result<Config, String> {
        Ok(Config {
            root_ca_cert: root_ca_cert.map(|buf| buf.as_ref().to_vec()),
            mtls: mtls.map(|(cert_chain, key)| MtlsConfig {
                cert_chain: cert_chain.as_ref().to_vec(),
                key: key.as_ref().to_vec(),
            }),
        })
    }

    pub fn new_without_mtls<Buf: AsRef<[u8]>>(root_ca_cert: Option<Buf>) -> Config {
        Config {
            root_ca_cert: root_ca_cert.map(|buf| buf.as_ref().to_vec()),
            mtls: None,
        }
    }

    /// Translate into tonic's client TLS configuration. Without an explicit root CA the
    /// system's native roots are used.
    pub fn to_client_config(&self) -> Result<ClientTlsConfig, String> {
        let mut tls_config = match &self.root_ca_cert {
            Some(pem) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem.clone())),
            None => ClientTlsConfig::new().with_native_roots(),
        };

        if let Some(mtls) = &self.mtls {
            tls_config =
                tls_config.identity(Identity::from_pem(mtls.cert_chain.clone(), mtls.key.clone()));
        }

        Ok(tls_config)
    }
}

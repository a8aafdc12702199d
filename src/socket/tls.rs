use crate::base::neterror::NetError;
use boring::ssl::{
    ConnectConfiguration, SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion,
};
use std::path::PathBuf;

/// Client TLS settings for upgrading an established connection.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    /// OpenSSL cipher string for TLS 1.2 and below. `None` keeps the library default.
    pub cipher_list: Option<String>,
    pub alpn_protos: Vec<String>,
    /// Verify the peer certificate chain and host name.
    pub verify_peer: bool,
    /// Extra trust anchors, PEM.
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            cipher_list: None,
            alpn_protos: Vec::new(),
            verify_peer: true,
            ca_file: None,
        }
    }
}

impl TlsConfig {
    /// Settings for test servers with self-signed certificates.
    pub fn insecure() -> Self {
        Self {
            verify_peer: false,
            ..Self::default()
        }
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min))?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max))?;
        }

        if let Some(ciphers) = &self.cipher_list {
            builder.set_cipher_list(ciphers)?;
        }

        if !self.alpn_protos.is_empty() {
            let mut alpn_wire = Vec::new();
            for proto in &self.alpn_protos {
                if proto.is_empty() || proto.len() > 255 {
                    return Err(NetError::Tls(format!("invalid ALPN protocol {:?}", proto)));
                }
                alpn_wire.push(proto.len() as u8);
                alpn_wire.extend_from_slice(proto.as_bytes());
            }
            builder.set_alpn_protos(&alpn_wire)?;
        }

        if let Some(ca_file) = &self.ca_file {
            builder.set_ca_file(ca_file)?;
        }

        builder.set_verify(if self.verify_peer {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });

        Ok(())
    }

    pub fn build_connector(&self) -> Result<SslConnector, NetError> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        self.apply_to_builder(&mut builder)?;
        Ok(builder.build())
    }

    /// Per-connection configuration for `host`.
    pub fn configure(&self, host: &str) -> Result<ConnectConfiguration, NetError> {
        let mut config = self.build_connector()?.configure()?;
        config.set_use_server_name_indication(Self::should_set_sni(host));
        config.set_verify_hostname(self.verify_peer);
        Ok(config)
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

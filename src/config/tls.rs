use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Enables TLS encryption towards the store
    /// Default: false (disabled)
    #[serde(default)]
    pub enabled: bool,

    /// Skip server certificate verification
    /// Default: false. Not supported; rejected by `validate()`
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Certificate Authority root certificate in PEM format
    /// Default: "" (system roots are not loaded; a CA file is required)
    #[serde(default)]
    pub ca_file: String,

    /// Client certificate chain in PEM format, for mutual TLS
    #[serde(default)]
    pub cert_file: String,

    /// Client private key in PEM format, for mutual TLS
    #[serde(default)]
    pub key_file: String,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.insecure_skip_verify {
            return Err(Error::Config(ConfigError::Message(
                "tls.insecure_skip_verify is not supported".into(),
            )));
        }

        if self.ca_file.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "tls.ca_file is required when TLS is enabled".into(),
            )));
        }

        if self.cert_file.is_empty() != self.key_file.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "tls.cert_file and tls.key_file must be set together".into(),
            )));
        }

        Ok(())
    }

    pub fn mutual(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }
}

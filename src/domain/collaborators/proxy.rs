use serde::{Deserialize, Serialize};

use crate::domain::model::raw_job::ProxyCredential;
use crate::domain::utils::id::SiteId;
use crate::error::TransferError;

/// Long-lived user certificate stored per (user, site).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub user: String,
    pub site: SiteId,
    pub subject: String,
    pub certificate_pem: String,
    pub key_pem: String,
}

/// Derives short-lived proxy credentials for the transfer program.
pub trait ProxyIssuer: std::fmt::Debug + Send + Sync {
    fn issue(&self, credential: &UserCredential, now: i64) -> Result<ProxyCredential, TransferError>;
}

#[derive(Debug, Clone)]
pub struct CertificateProxyIssuer {
    lifetime_secs: i64,
}

impl CertificateProxyIssuer {
    pub fn new(lifetime_secs: i64) -> Self {
        CertificateProxyIssuer { lifetime_secs }
    }
}

impl Default for CertificateProxyIssuer {
    fn default() -> Self {
        CertificateProxyIssuer::new(12 * 3600)
    }
}

impl ProxyIssuer for CertificateProxyIssuer {
    fn issue(&self, credential: &UserCredential, now: i64) -> Result<ProxyCredential, TransferError> {
        if credential.certificate_pem.trim().is_empty() || credential.key_pem.trim().is_empty() {
            return Err(TransferError::Validation(format!(
                "stored credential of user {} at site {} has no certificate or key",
                credential.user, credential.site
            )));
        }

        Ok(ProxyCredential {
            subject: format!("{}/CN=proxy", credential.subject),
            pem: format!("{}\n{}", credential.certificate_pem.trim_end(), credential.key_pem.trim_end()),
            expires_at: now + self.lifetime_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(cert: &str) -> UserCredential {
        UserCredential {
            user: "alice".into(),
            site: SiteId::new("a"),
            subject: "/DC=org/CN=Alice".into(),
            certificate_pem: cert.into(),
            key_pem: "KEY".into(),
        }
    }

    #[test]
    fn proxy_expires_after_lifetime() {
        let proxy = CertificateProxyIssuer::new(60).issue(&credential("CERT"), 1000).unwrap();
        assert_eq!(proxy.subject, "/DC=org/CN=Alice/CN=proxy");
        assert_eq!(proxy.pem, "CERT\nKEY");
        assert_eq!(proxy.expires_at, 1060);
    }

    #[test]
    fn empty_certificate_is_rejected() {
        let err = CertificateProxyIssuer::default().issue(&credential(" "), 0).unwrap_err();
        assert!(matches!(err, TransferError::Validation(_)));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::utils::id::{DtnId, SiteId, StorageId};
use crate::error::ConversionError;

/// A `site|storage|dtn|path` location. The DTN part may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub site: SiteId,
    pub storage: StorageId,
    pub dtn: Option<DtnId>,
    pub path: String,
}

impl FromStr for EndpointSpec {
    type Err = ConversionError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.splitn(4, '|').collect();
        let [site, storage, dtn, path] = parts.as_slice() else {
            return Err(ConversionError::InvalidEndpointSpec(spec.to_string()));
        };

        let (site, storage, dtn, path) = (site.trim(), storage.trim(), dtn.trim(), path.trim());
        if site.is_empty() || storage.is_empty() || path.is_empty() || !path.starts_with('/') {
            return Err(ConversionError::InvalidEndpointSpec(spec.to_string()));
        }

        Ok(EndpointSpec {
            site: SiteId::new(site),
            storage: StorageId::new(storage),
            dtn: if dtn.is_empty() { None } else { Some(DtnId::new(dtn)) },
            path: path.to_string(),
        })
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dtn = self.dtn.as_ref().map(|d| d.as_str()).unwrap_or("");
        write!(f, "{}|{}|{}|{}", self.site, self.storage, dtn, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let spec: EndpointSpec = "fnal|lustre1|dtn3|/data/run7".parse().unwrap();
        assert_eq!(spec.site, SiteId::new("fnal"));
        assert_eq!(spec.storage, StorageId::new("lustre1"));
        assert_eq!(spec.dtn, Some(DtnId::new("dtn3")));
        assert_eq!(spec.path, "/data/run7");
        assert_eq!(spec.to_string(), "fnal|lustre1|dtn3|/data/run7");
    }

    #[test]
    fn empty_dtn_is_allowed() {
        let spec: EndpointSpec = "anl|gpfs||/scratch/in".parse().unwrap();
        assert_eq!(spec.dtn, None);
    }

    #[test]
    fn path_may_contain_pipes() {
        let spec: EndpointSpec = "anl|gpfs||/odd|name".parse().unwrap();
        assert_eq!(spec.path, "/odd|name");
    }

    #[test]
    fn rejects_malformed_specs() {
        for bad in ["", "anl|gpfs|/x", "|gpfs||/x", "anl||dtn|/x", "anl|gpfs|dtn|relative", "anl|gpfs|dtn|"] {
            assert!(bad.parse::<EndpointSpec>().is_err(), "{bad}");
        }
    }
}

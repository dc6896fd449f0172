//! Oxidimse settings, which are configurable using environment variables.
use crate::ae_context::{AeContext, Role, Timeouts, supported_transfer_syntaxes};
use crate::ae_title::AeTitle;
use crate::uids;
use camino::Utf8PathBuf;
use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Figment> = OnceLock::new();

/// Configuration read from `OXIDIMSE_*` environment variables, see
/// [OxidimseEnvOptions::figment].
pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(OxidimseEnvOptions::figment)
}

#[derive(Debug, Deserialize)]
pub struct OxidimseEnvOptions {
    pub files_root: Utf8PathBuf,
    #[serde(default)]
    pub scp: ScpSettings,
    /// Only accept uncompressed transfer syntaxes.
    #[serde(default)]
    pub uncompressed_only: bool,
    #[serde(default = "default_max_pdu_length")]
    pub max_pdu_length: u32,
    #[serde(default)]
    pub timeout: TimeoutSettings,
    /// Known remote AEs, written as `AET=host:port,AET=host:port`.
    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: HashMap<AeTitle, String>,
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScpSettings {
    /// Our AE title.
    pub aet: AeTitle,
    /// Whether receiving PDUs must not surpass the negotiated maximum PDU length.
    pub strict: bool,
    /// Whether to accept unknown abstract syntaxes.
    pub promiscuous: bool,
}

impl Default for ScpSettings {
    fn default() -> Self {
        Self {
            aet: AeTitle::from_static("OXIDIMSE"),
            strict: false,
            promiscuous: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    #[serde(with = "humantime_serde")]
    pub request: Duration,
    #[serde(with = "humantime_serde")]
    pub release: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let Timeouts {
            connect,
            request,
            release,
        } = Timeouts::default();
        Self {
            connect,
            request,
            release,
        }
    }
}

impl OxidimseEnvOptions {
    /// Environment variables prefixed with `OXIDIMSE_`. Nested keys are separated by `_`,
    /// e.g. `OXIDIMSE_SCP_AET`, while top-level keys may contain `_` themselves.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Env::prefixed("OXIDIMSE_").split("_"))
            .merge(Env::prefixed("OXIDIMSE_"))
    }

    /// The local AE: Verification, Storage, Query/Retrieve and Storage Commitment as an SCP.
    /// Storage is also usable as an SCU, for C-MOVE and C-GET sub-operations.
    pub fn ae_context(&self) -> AeContext {
        let transfer_syntaxes: Vec<String> = if self.uncompressed_only {
            uids::UNCOMPRESSED_TRANSFER_SYNTAXES
                .iter()
                .map(|ts| ts.to_string())
                .collect()
        } else {
            supported_transfer_syntaxes()
        };
        let mut ae = AeContext::new(self.scp.aet.clone())
            .with_max_pdu_length(self.max_pdu_length)
            .with_timeouts(Timeouts {
                connect: self.timeout.connect,
                request: self.timeout.request,
                release: self.timeout.release,
            })
            .strict(self.scp.strict)
            .promiscuous(self.scp.promiscuous)
            .with_max_associations(self.max_associations)
            .with_peers(self.peers.clone())
            .with_scp(uids::VERIFICATION)
            .with_scp(uids::STORAGE_COMMITMENT_PUSH_MODEL);
        for model in uids::QR_FIND_MODELS
            .iter()
            .chain(uids::QR_MOVE_MODELS)
            .chain(uids::QR_GET_MODELS)
        {
            ae = ae.with_scp(*model);
        }
        for sop_class in uids::STORAGE_SOP_CLASSES {
            ae = ae
                .with_capability(*sop_class, Role::Scp, transfer_syntaxes.iter().cloned())
                .with_capability(*sop_class, Role::Scu, transfer_syntaxes.iter().cloned());
        }
        ae
    }
}

fn deserialize_peers<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<AeTitle, String>, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_string_dict(&s).map_err(serde::de::Error::custom)
}

fn parse_string_dict(s: &str) -> Result<HashMap<AeTitle, String>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_key_value_pair)
        .collect()
}

fn parse_key_value_pair(s: &str) -> Result<(AeTitle, String), String> {
    let (aet, address) = s
        .split_once('=')
        .ok_or_else(|| format!("bad value for peers: \"{s}\" does not contain a '='"))?;
    let aet = AeTitle::new(aet.trim().to_string())
        .map_err(|e| format!("bad AE title \"{aet}\": {e}"))?;
    Ok((aet, address.trim().to_string()))
}

fn default_max_pdu_length() -> u32 {
    crate::pdu::DEFAULT_MAX_PDU_LENGTH
}

fn default_max_associations() -> usize {
    16
}

fn default_listener_port() -> u16 {
    11111
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    #[case("", [])]
    #[case("DEST=1.2.3.4:4242", [("DEST", "1.2.3.4:4242")])]
    #[case("DEST=1.2.3.4:4242,", [("DEST", "1.2.3.4:4242")])]
    #[case(
        "DEST=1.2.3.4:4242, SCU-B=5.6.7.8:9090",
        [("DEST", "1.2.3.4:4242"), ("SCU-B", "5.6.7.8:9090")]
    )]
    fn test_parse_string_dict(
        #[case] given: &str,
        #[case] expected: impl IntoIterator<Item = (&'static str, &'static str)>,
    ) {
        let expected: HashMap<_, _> = expected
            .into_iter()
            .map(|(aet, addr)| (AeTitle::from_static(aet), addr.to_string()))
            .collect();
        assert_eq!(parse_string_dict(given).unwrap(), expected)
    }

    #[rstest]
    #[case("DEST")]
    #[case("=1.2.3.4:4242")]
    fn test_parse_string_dict_error(#[case] given: &str) {
        assert!(parse_string_dict(given).is_err())
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("OXIDIMSE_FILES_ROOT", "/data");
            let options: OxidimseEnvOptions = OxidimseEnvOptions::figment().extract()?;
            assert_eq!(options.files_root, Utf8PathBuf::from("/data"));
            assert_eq!(options.scp.aet.as_str(), "OXIDIMSE");
            assert_eq!(options.listener_port, 11111);
            assert_eq!(options.max_pdu_length, 16384);
            assert_eq!(options.timeout.release, Timeouts::default().release);
            assert!(options.peers.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("OXIDIMSE_FILES_ROOT", "/data");
            jail.set_env("OXIDIMSE_SCP_AET", "SCP-A");
            jail.set_env("OXIDIMSE_SCP_STRICT", "true");
            jail.set_env("OXIDIMSE_TIMEOUT_REQUEST", "5s");
            jail.set_env("OXIDIMSE_PEERS", "DEST=127.0.0.1:4242");
            jail.set_env("OXIDIMSE_UNCOMPRESSED_ONLY", "true");
            jail.set_env("OXIDIMSE_MAX_ASSOCIATIONS", "2");
            let options: OxidimseEnvOptions = OxidimseEnvOptions::figment().extract()?;
            assert_eq!(options.scp.aet.as_str(), "SCP-A");
            assert!(options.scp.strict);
            assert_eq!(options.timeout.request, Duration::from_secs(5));
            assert_eq!(options.max_associations, 2);

            let ae = options.ae_context();
            assert_eq!(ae.ae_title().as_str(), "SCP-A");
            assert!(ae.is_strict());
            assert_eq!(ae.max_associations(), 2);
            assert_eq!(ae.peer("DEST").unwrap().address, "127.0.0.1:4242");
            assert!(ae.supports(uids::STUDY_ROOT_QR_FIND, Role::Scp));
            assert!(ae.supports(uids::CT_IMAGE_STORAGE, Role::Scu));
            assert_eq!(
                ae.transfer_syntaxes(uids::CT_IMAGE_STORAGE),
                uids::UNCOMPRESSED_TRANSFER_SYNTAXES.to_vec()
            );
            Ok(())
        });
    }
}

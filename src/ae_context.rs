use std::collections::HashMap;
use std::time::Duration;

use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::ae_title::AeTitle;
use crate::pdu::DEFAULT_MAX_PDU_LENGTH;
use crate::uids;

/// Role of the local application entity for an abstract syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Scu,
    Scp,
}

/// An abstract syntax this AE can handle in one role, and the transfer syntaxes it can use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCapability {
    pub abstract_syntax: String,
    pub role: Role,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus A-ASSOCIATE handshake.
    pub connect: Duration,
    /// Time to wait for each response to an outstanding request.
    pub request: Duration,
    /// Time to wait for A-RELEASE-RP.
    pub release: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            request: Duration::from_secs(60),
            release: Duration::from_secs(10),
        }
    }
}

/// A remote application entity: its title and its `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ae_title: AeTitle,
    pub address: String,
}

impl Target {
    pub fn new(ae_title: AeTitle, address: impl Into<String>) -> Self {
        Self {
            ae_title,
            address: address.into(),
        }
    }
}

/// Long-lived configuration of the local application entity. It is shared by every association
/// the AE opens or accepts, and never changes while they run.
#[derive(Debug, Clone)]
pub struct AeContext {
    ae_title: AeTitle,
    capabilities: Vec<TransferCapability>,
    max_pdu_length: u32,
    timeouts: Timeouts,
    strict: bool,
    promiscuous: bool,
    check_called_ae_title: bool,
    max_associations: usize,
    peers: HashMap<AeTitle, String>,
}

impl AeContext {
    pub fn new(ae_title: AeTitle) -> Self {
        Self {
            ae_title,
            capabilities: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            timeouts: Timeouts::default(),
            strict: false,
            promiscuous: false,
            check_called_ae_title: true,
            max_associations: 16,
            peers: HashMap::new(),
        }
    }

    pub fn with_capability<S: Into<String>>(
        mut self,
        abstract_syntax: impl Into<String>,
        role: Role,
        transfer_syntaxes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.capabilities.push(TransferCapability {
            abstract_syntax: abstract_syntax.into(),
            role,
            transfer_syntaxes: transfer_syntaxes.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Handle `abstract_syntax` as an SCP using the uncompressed transfer syntaxes.
    pub fn with_scp(self, abstract_syntax: impl Into<String>) -> Self {
        self.with_capability(
            abstract_syntax,
            Role::Scp,
            uids::UNCOMPRESSED_TRANSFER_SYNTAXES.iter().copied(),
        )
    }

    /// Handle `abstract_syntax` as an SCU using the uncompressed transfer syntaxes.
    pub fn with_scu(self, abstract_syntax: impl Into<String>) -> Self {
        self.with_capability(
            abstract_syntax,
            Role::Scu,
            uids::UNCOMPRESSED_TRANSFER_SYNTAXES.iter().copied(),
        )
    }

    /// Maximum length of P-DATA-TF PDUs we are willing to receive, 0 meaning unlimited.
    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.release = timeout;
        self
    }

    /// Treat incoming P-DATA-TF PDUs longer than our maximum as a protocol violation.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Accept abstract syntaxes we have no capability for, as an SCP with uncompressed
    /// transfer syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Whether to reject associations whose called AE title is not ours.
    pub fn check_called_ae_title(mut self, check: bool) -> Self {
        self.check_called_ae_title = check;
        self
    }

    pub fn with_max_associations(mut self, max_associations: usize) -> Self {
        self.max_associations = max_associations;
        self
    }

    /// Register a known remote AE, used as C-MOVE destination or Storage Commitment report
    /// recipient.
    pub fn with_peer(mut self, ae_title: AeTitle, address: impl Into<String>) -> Self {
        self.peers.insert(ae_title, address.into());
        self
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = (AeTitle, String)>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn ae_title(&self) -> &AeTitle {
        &self.ae_title
    }

    pub fn capabilities(&self) -> &[TransferCapability] {
        &self.capabilities
    }

    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    pub fn checks_called_ae_title(&self) -> bool {
        self.check_called_ae_title
    }

    pub fn max_associations(&self) -> usize {
        self.max_associations
    }

    /// Look up a known remote AE.
    pub fn peer(&self, ae_title: &str) -> Option<Target> {
        let ae_title = AeTitle::new(ae_title.to_string()).ok()?;
        self.peers
            .get(&ae_title)
            .map(|address| Target::new(ae_title, address.clone()))
    }

    pub fn supports(&self, abstract_syntax: &str, role: Role) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.role == role && c.abstract_syntax == abstract_syntax)
    }

    /// Transfer syntaxes usable with an abstract syntax in any role, in order of preference.
    pub fn transfer_syntaxes(&self, abstract_syntax: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for capability in self
            .capabilities
            .iter()
            .filter(|c| c.abstract_syntax == abstract_syntax)
        {
            for ts in &capability.transfer_syntaxes {
                if !out.contains(&ts.as_str()) {
                    out.push(ts);
                }
            }
        }
        out
    }
}

/// Every transfer syntax dicom-rs can decode and encode datasets with.
pub fn supported_transfer_syntaxes() -> Vec<String> {
    let mut all: Vec<String> = uids::UNCOMPRESSED_TRANSFER_SYNTAXES
        .iter()
        .map(|ts| ts.to_string())
        .collect();
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() && !all.iter().any(|known| known == ts.uid()) {
            all.push(ts.uid().to_string());
        }
    }
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_syntaxes_are_merged_across_roles() {
        let ae = AeContext::new(AeTitle::from_static("TEST"))
            .with_capability(uids::CT_IMAGE_STORAGE, Role::Scp, [uids::EXPLICIT_VR_LITTLE_ENDIAN])
            .with_capability(
                uids::CT_IMAGE_STORAGE,
                Role::Scu,
                [uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, uids::EXPLICIT_VR_LITTLE_ENDIAN],
            );
        assert_eq!(
            ae.transfer_syntaxes(uids::CT_IMAGE_STORAGE),
            vec![uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN]
        );
        assert!(ae.supports(uids::CT_IMAGE_STORAGE, Role::Scu));
        assert!(!ae.supports(uids::MR_IMAGE_STORAGE, Role::Scp));
    }

    #[test]
    fn test_peer_lookup() {
        let ae = AeContext::new(AeTitle::from_static("TEST"))
            .with_peer(AeTitle::from_static("DEST"), "127.0.0.1:4242");
        assert_eq!(ae.peer("DEST").unwrap().address, "127.0.0.1:4242");
        assert!(ae.peer("NOWHERE").is_none());
        assert!(ae.peer("").is_none());
    }

    #[test]
    fn test_supported_transfer_syntaxes_start_uncompressed() {
        let all = supported_transfer_syntaxes();
        assert_eq!(&all[..2], &[uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN]);
    }
}

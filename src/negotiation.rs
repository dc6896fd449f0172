//! Presentation context and role negotiation of A-ASSOCIATE.
//!
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_D.3.3.4.html>

use crate::ae_context::{AeContext, Role};
use crate::ae_title::AeTitle;
use crate::error::DimseError;
use crate::pdu::{
    AssociateAc, AssociateRj, AssociateRq, MINIMUM_PDU_LENGTH, PresentationContextProposal,
    PresentationContextResult, PresentationContextResultItem, RejectReason, RoleSelection,
    UserInformation,
};
use crate::uids;

/// An abstract syntax to propose, with the roles the requester wants to play for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub abstract_syntax: String,
    pub scu: bool,
    pub scp: bool,
}

impl Proposal {
    pub fn scu(abstract_syntax: impl Into<String>) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            scu: true,
            scp: false,
        }
    }

    pub fn scp(abstract_syntax: impl Into<String>) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            scu: false,
            scp: true,
        }
    }

    /// Both roles, as C-GET requesters do for storage SOP classes.
    pub fn scu_scp(abstract_syntax: impl Into<String>) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            scu: true,
            scp: true,
        }
    }

    fn is_default_role(&self) -> bool {
        self.scu && !self.scp
    }
}

impl From<&str> for Proposal {
    fn from(abstract_syntax: &str) -> Self {
        Proposal::scu(abstract_syntax)
    }
}

/// An accepted presentation context, frozen for the life of the association.
///
/// `scu` and `scp` are the roles of the *local* application entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
    pub scu: bool,
    pub scp: bool,
}

impl PresentationContext {
    pub fn permits(&self, role: Role) -> bool {
        match role {
            Role::Scu => self.scu,
            Role::Scp => self.scp,
        }
    }
}

/// Build the A-ASSOCIATE-RQ of `ae` calling `called`, one presentation context per proposal
/// with IDs 1, 3, 5...
pub fn propose(
    ae: &AeContext,
    called: &AeTitle,
    proposals: &[Proposal],
) -> Result<AssociateRq, DimseError> {
    if proposals.is_empty() || proposals.len() > 128 {
        return Err(DimseError::Config(format!(
            "cannot propose {} presentation contexts, must be between 1 and 128",
            proposals.len()
        )));
    }
    let presentation_contexts = proposals
        .iter()
        .enumerate()
        .map(|(i, proposal)| {
            let mut transfer_syntaxes: Vec<String> = ae
                .transfer_syntaxes(&proposal.abstract_syntax)
                .into_iter()
                .map(str::to_string)
                .collect();
            if transfer_syntaxes.is_empty() {
                transfer_syntaxes = uids::UNCOMPRESSED_TRANSFER_SYNTAXES
                    .iter()
                    .map(|ts| ts.to_string())
                    .collect();
            }
            PresentationContextProposal {
                id: (2 * i + 1) as u8,
                abstract_syntax: proposal.abstract_syntax.clone(),
                transfer_syntaxes,
            }
        })
        .collect();
    let mut role_selections: Vec<RoleSelection> = Vec::new();
    for proposal in proposals.iter().filter(|p| !p.is_default_role()) {
        if role_selections
            .iter()
            .all(|r| r.sop_class_uid != proposal.abstract_syntax)
        {
            role_selections.push(RoleSelection {
                sop_class_uid: proposal.abstract_syntax.clone(),
                scu_role: proposal.scu,
                scp_role: proposal.scp,
            });
        }
    }
    Ok(AssociateRq {
        protocol_version: 1,
        called_ae_title: called.to_string(),
        calling_ae_title: ae.ae_title().to_string(),
        application_context: uids::APPLICATION_CONTEXT.to_string(),
        presentation_contexts,
        user_information: user_information(ae, role_selections, None),
    })
}

fn user_information(
    ae: &AeContext,
    role_selections: Vec<RoleSelection>,
    async_operations_window: Option<(u16, u16)>,
) -> UserInformation {
    UserInformation {
        max_length: ae.max_pdu_length(),
        implementation_class_uid: uids::IMPLEMENTATION_CLASS_UID.to_string(),
        implementation_version_name: Some(uids::IMPLEMENTATION_VERSION_NAME.to_string()),
        async_operations_window,
        role_selections,
        other: Vec::new(),
    }
}

/// Outcome of a successful negotiation on the acceptor side.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub ac: AssociateAc,
    pub contexts: Vec<PresentationContext>,
    pub calling_ae_title: AeTitle,
    /// Maximum P-DATA-TF length the requester can receive, 0 meaning unlimited.
    pub peer_max_pdu_length: u32,
}

/// Decide on an A-ASSOCIATE-RQ received by `ae`.
///
/// Every proposed context gets a result: unsupported ones are rejected individually while the
/// association as a whole is still accepted.
pub fn negotiate(ae: &AeContext, rq: &AssociateRq) -> Result<Negotiated, AssociateRj> {
    let reject = |permanent, reason| AssociateRj { permanent, reason };
    if rq.application_context != uids::APPLICATION_CONTEXT {
        return Err(reject(true, RejectReason::ApplicationContextNameNotSupported));
    }
    if rq.protocol_version & 0x0001 == 0 {
        return Err(reject(true, RejectReason::ProtocolVersionNotSupported));
    }
    let calling_ae_title = AeTitle::new(rq.calling_ae_title.clone())
        .map_err(|_| reject(true, RejectReason::CallingAeTitleNotRecognized))?;
    if ae.checks_called_ae_title() && rq.called_ae_title != ae.ae_title().as_str() {
        return Err(reject(true, RejectReason::CalledAeTitleNotRecognized));
    }
    let peer_max_pdu_length = rq.user_information.max_length;
    if peer_max_pdu_length != 0 && peer_max_pdu_length < MINIMUM_PDU_LENGTH {
        return Err(reject(false, RejectReason::LocalLimitExceeded));
    }

    let mut results = Vec::with_capacity(rq.presentation_contexts.len());
    let mut contexts = Vec::new();
    let mut accepted_roles: Vec<RoleSelection> = Vec::new();
    for proposal in &rq.presentation_contexts {
        let abstract_syntax = proposal.abstract_syntax.as_str();
        let has_scp = ae.supports(abstract_syntax, Role::Scp);
        let has_scu = ae.supports(abstract_syntax, Role::Scu);
        let promiscuous = !has_scp && !has_scu && ae.is_promiscuous();
        let requested_role = rq
            .user_information
            .role_selections
            .iter()
            .find(|r| r.sop_class_uid == abstract_syntax);
        // without role selection the requester is the SCU and we are the SCP
        let role = requested_role.map(|requested| RoleSelection {
            sop_class_uid: abstract_syntax.to_string(),
            scu_role: requested.scu_role && (has_scp || promiscuous),
            scp_role: requested.scp_role && has_scu,
        });
        let (local_scu, local_scp) = match &role {
            Some(role) => (role.scp_role, role.scu_role),
            None => (false, has_scp || promiscuous),
        };
        if !local_scu && !local_scp {
            let result = PresentationContextResult::AbstractSyntaxNotSupported;
            results.push(rejected(proposal.id, result));
            continue;
        }
        let ours = if promiscuous {
            uids::UNCOMPRESSED_TRANSFER_SYNTAXES.to_vec()
        } else {
            ae.transfer_syntaxes(abstract_syntax)
        };
        let Some(transfer_syntax) = proposal
            .transfer_syntaxes
            .iter()
            .find(|ts| ours.contains(&ts.as_str()))
        else {
            let result = PresentationContextResult::TransferSyntaxesNotSupported;
            results.push(rejected(proposal.id, result));
            continue;
        };
        if let Some(role) = role
            && accepted_roles.iter().all(|r| r.sop_class_uid != role.sop_class_uid)
        {
            accepted_roles.push(role);
        }
        results.push(PresentationContextResultItem {
            id: proposal.id,
            result: PresentationContextResult::Acceptance,
            transfer_syntax: transfer_syntax.clone(),
        });
        contexts.push(PresentationContext {
            id: proposal.id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntax: transfer_syntax.clone(),
            scu: local_scu,
            scp: local_scp,
        });
    }

    let async_window = rq.user_information.async_operations_window.map(|_| (1, 1));
    Ok(Negotiated {
        ac: AssociateAc {
            protocol_version: 1,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context: uids::APPLICATION_CONTEXT.to_string(),
            presentation_contexts: results,
            user_information: user_information(ae, accepted_roles, async_window),
        },
        contexts,
        calling_ae_title,
        peer_max_pdu_length,
    })
}

fn rejected(id: u8, result: PresentationContextResult) -> PresentationContextResultItem {
    PresentationContextResultItem {
        id,
        result,
        transfer_syntax: String::new(),
    }
}

/// Requester side: the presentation contexts accepted in `ac`, validated against what `rq`
/// proposed. A-ASSOCIATE-AC with no accepted context at all is an error.
pub fn accepted_contexts(
    rq: &AssociateRq,
    ac: &AssociateAc,
) -> Result<Vec<PresentationContext>, DimseError> {
    let mut contexts = Vec::new();
    for item in &ac.presentation_contexts {
        let proposal = rq
            .presentation_contexts
            .iter()
            .find(|p| p.id == item.id)
            .ok_or_else(|| {
                DimseError::MalformedPdu(format!(
                    "A-ASSOCIATE-AC answers presentation context {} which was never proposed",
                    item.id
                ))
            })?;
        if item.result != PresentationContextResult::Acceptance {
            tracing::debug!(
                presentation_context = item.id,
                abstract_syntax = proposal.abstract_syntax,
                result = ?item.result,
                "presentation context rejected"
            );
            continue;
        }
        if !proposal.transfer_syntaxes.contains(&item.transfer_syntax) {
            return Err(DimseError::MalformedPdu(format!(
                "transfer syntax {} accepted for presentation context {} was never proposed",
                item.transfer_syntax, item.id
            )));
        }
        let proposed_role = rq
            .user_information
            .role_selections
            .iter()
            .find(|r| r.sop_class_uid == proposal.abstract_syntax);
        let accepted_role = ac
            .user_information
            .role_selections
            .iter()
            .find(|r| r.sop_class_uid == proposal.abstract_syntax);
        let (scu, scp) = match (proposed_role, accepted_role) {
            (Some(proposed), Some(accepted)) => (
                proposed.scu_role && accepted.scu_role,
                proposed.scp_role && accepted.scp_role,
            ),
            _ => (true, false),
        };
        contexts.push(PresentationContext {
            id: item.id,
            abstract_syntax: proposal.abstract_syntax.clone(),
            transfer_syntax: item.transfer_syntax.clone(),
            scu,
            scp,
        });
    }
    if contexts.is_empty() {
        let abstract_syntax = rq
            .presentation_contexts
            .first()
            .map(|p| p.abstract_syntax.clone())
            .unwrap_or_default();
        return Err(DimseError::UnsupportedPresentationContext { abstract_syntax });
    }
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn scp() -> AeContext {
        AeContext::new(AeTitle::from_static("SCP-A"))
            .with_scp(uids::VERIFICATION)
            .with_capability(
                uids::CT_IMAGE_STORAGE,
                Role::Scp,
                [uids::EXPLICIT_VR_LITTLE_ENDIAN],
            )
            .with_scu(uids::CT_IMAGE_STORAGE)
            .with_scp(uids::STUDY_ROOT_QR_GET)
    }

    #[fixture]
    fn scu() -> AeContext {
        AeContext::new(AeTitle::from_static("SCU"))
    }

    #[rstest]
    fn test_ids_are_odd_and_successive(scu: AeContext) {
        let rq = propose(
            &scu,
            &AeTitle::from_static("SCP-A"),
            &[
                uids::VERIFICATION.into(),
                uids::CT_IMAGE_STORAGE.into(),
                uids::MR_IMAGE_STORAGE.into(),
            ],
        )
        .unwrap();
        let ids: Vec<u8> = rq.presentation_contexts.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert!(rq.user_information.role_selections.is_empty());
    }

    #[rstest]
    fn test_per_context_rejection_is_not_fatal(scp: AeContext, scu: AeContext) {
        let called = AeTitle::from_static("SCP-A");
        let mut rq = propose(
            &scu,
            &called,
            &[
                uids::VERIFICATION.into(),
                uids::MR_IMAGE_STORAGE.into(),
                uids::CT_IMAGE_STORAGE.into(),
            ],
        )
        .unwrap();
        rq.presentation_contexts[2].transfer_syntaxes =
            vec![uids::EXPLICIT_VR_BIG_ENDIAN.to_string()];
        let negotiated = negotiate(&scp, &rq).unwrap();
        let results: Vec<_> = negotiated
            .ac
            .presentation_contexts
            .iter()
            .map(|r| r.result)
            .collect();
        assert_eq!(
            results,
            vec![
                PresentationContextResult::Acceptance,
                PresentationContextResult::AbstractSyntaxNotSupported,
                PresentationContextResult::TransferSyntaxesNotSupported,
            ]
        );
        let contexts = accepted_contexts(&rq, &negotiated.ac).unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].abstract_syntax, uids::VERIFICATION);
        assert!(contexts[0].scu && !contexts[0].scp);
        assert!(negotiated.contexts[0].scp && !negotiated.contexts[0].scu);
    }

    #[rstest]
    fn test_first_mutually_supported_transfer_syntax_wins(scp: AeContext, scu: AeContext) {
        let called = AeTitle::from_static("SCP-A");
        let mut rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        rq.presentation_contexts[0].transfer_syntaxes = vec![
            uids::EXPLICIT_VR_BIG_ENDIAN.to_string(),
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ];
        let negotiated = negotiate(&scp, &rq).unwrap();
        assert_eq!(
            negotiated.contexts[0].transfer_syntax,
            uids::IMPLICIT_VR_LITTLE_ENDIAN
        );
    }

    #[rstest]
    fn test_get_role_reversal(scp: AeContext) {
        let scu = AeContext::new(AeTitle::from_static("GET-SCU"))
            .with_capability(uids::CT_IMAGE_STORAGE, Role::Scp, [uids::EXPLICIT_VR_LITTLE_ENDIAN]);
        let rq = propose(
            &scu,
            &AeTitle::from_static("SCP-A"),
            &[
                Proposal::scu(uids::STUDY_ROOT_QR_GET),
                Proposal::scu_scp(uids::CT_IMAGE_STORAGE),
            ],
        )
        .unwrap();
        assert_eq!(rq.user_information.role_selections.len(), 1);
        let negotiated = negotiate(&scp, &rq).unwrap();
        let storage = &negotiated.contexts[1];
        assert!(storage.scu && storage.scp);
        let ours = accepted_contexts(&rq, &negotiated.ac).unwrap();
        assert!(ours[1].scu && ours[1].scp);
    }

    #[rstest]
    #[case("SCP-B", RejectReason::CalledAeTitleNotRecognized, true)]
    fn test_called_ae_title_mismatch(
        scu: AeContext,
        #[case] configured: &'static str,
        #[case] reason: RejectReason,
        #[case] permanent: bool,
    ) {
        let acceptor =
            AeContext::new(AeTitle::from_static(configured)).with_scp(uids::VERIFICATION);
        let called = AeTitle::from_static("SCP-A");
        let rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        assert_eq!(
            negotiate(&acceptor, &rq).unwrap_err(),
            AssociateRj { permanent, reason }
        );
    }

    #[rstest]
    fn test_tiny_max_pdu_is_rejected(scp: AeContext) {
        let scu = AeContext::new(AeTitle::from_static("SCU")).with_max_pdu_length(1024);
        let called = AeTitle::from_static("SCP-A");
        let rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        assert_eq!(
            negotiate(&scp, &rq).unwrap_err().reason,
            RejectReason::LocalLimitExceeded
        );
    }

    #[rstest]
    fn test_unknown_application_context(scp: AeContext, scu: AeContext) {
        let called = AeTitle::from_static("SCP-A");
        let mut rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        rq.application_context = "1.2.3".to_string();
        assert_eq!(
            negotiate(&scp, &rq).unwrap_err().reason,
            RejectReason::ApplicationContextNameNotSupported
        );
    }

    #[rstest]
    fn test_promiscuous(scu: AeContext) {
        let acceptor = AeContext::new(AeTitle::from_static("SCP-A")).promiscuous(true);
        let called = AeTitle::from_static("SCP-A");
        let rq = propose(&scu, &called, &[uids::ENHANCED_SR_STORAGE.into()]).unwrap();
        let negotiated = negotiate(&acceptor, &rq).unwrap();
        assert_eq!(negotiated.contexts.len(), 1);
        assert!(negotiated.contexts[0].scp);
    }

    #[rstest]
    fn test_context_without_usable_role_is_rejected(scu: AeContext) {
        let acceptor = AeContext::new(AeTitle::from_static("SCP-A"))
            .with_scp(uids::VERIFICATION)
            .with_scu(uids::CT_IMAGE_STORAGE);
        let called = AeTitle::from_static("SCP-A");
        let proposals: [Proposal; 2] =
            [uids::VERIFICATION.into(), uids::CT_IMAGE_STORAGE.into()];
        let rq = propose(&scu, &called, &proposals).unwrap();
        assert!(rq.user_information.role_selections.is_empty());
        let negotiated = negotiate(&acceptor, &rq).unwrap();
        assert_eq!(
            negotiated.ac.presentation_contexts[1].result,
            PresentationContextResult::AbstractSyntaxNotSupported
        );
        assert_eq!(negotiated.contexts.len(), 1);
        assert_eq!(negotiated.contexts[0].abstract_syntax, uids::VERIFICATION);
    }

    #[rstest]
    fn test_nothing_accepted(scu: AeContext) {
        let acceptor = AeContext::new(AeTitle::from_static("SCP-A"));
        let called = AeTitle::from_static("SCP-A");
        let rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        let negotiated = negotiate(&acceptor, &rq).unwrap();
        assert!(matches!(
            accepted_contexts(&rq, &negotiated.ac),
            Err(DimseError::UnsupportedPresentationContext { .. })
        ));
    }

    #[rstest]
    fn test_accepted_transfer_syntax_must_have_been_proposed(scp: AeContext, scu: AeContext) {
        let called = AeTitle::from_static("SCP-A");
        let rq = propose(&scu, &called, &[uids::VERIFICATION.into()]).unwrap();
        let mut ac = negotiate(&scp, &rq).unwrap().ac;
        ac.presentation_contexts[0].transfer_syntax = uids::EXPLICIT_VR_BIG_ENDIAN.to_string();
        assert!(matches!(
            accepted_contexts(&rq, &ac),
            Err(DimseError::MalformedPdu(_))
        ));
    }
}

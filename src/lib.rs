//! DICOM Upper Layer associations and DIMSE services over TCP.
//!
//! [Association] carries DIMSE messages over an established association, [Scu] runs
//! operations against remote AEs, and [Acceptor] serves incoming associations with the
//! handlers of a [ServiceRegistry].

mod ae_context;
mod ae_title;
mod association;
mod client;
mod command;
mod dataset;
mod directory_store;
mod dispatcher;
mod error;
mod memory_store;
mod message;
mod negotiation;
mod pdata;
mod pdu;
mod run_from_env;
mod server;
mod settings;
mod status;

pub mod services;
pub mod uids;

pub use ae_context::{
    AeContext, Role, Target, Timeouts, TransferCapability, supported_transfer_syntaxes,
};
pub use ae_title::{AeTitle, InvalidAeTitle};
pub use association::{Association, AssociationState, ResponseStream};
pub use client::{
    CommitmentRequest, FindOptions, FindResults, RetrieveOptions, Scu, new_transaction_uid,
};
pub use command::{CommandField, CommandSet};
pub use dataset::{Dataset, QueryLevel, SopReference, failure_reason};
pub use directory_store::DirectoryStore;
pub use dispatcher::{ServiceContext, ServiceHandler, ServiceRegistry};
pub use error::{DatasetError, DimseError, PersistError, QueryError};
pub use memory_store::MemoryStore;
pub use message::{DimseMessage, RetrieveOutcome, SubOperationCounts};
pub use negotiation::{PresentationContext, Proposal};
pub use pdu::{Pdu, PduCodec, RejectReason};
pub use run_from_env::{run, run_from_env};
pub use server::Acceptor;
pub use settings::{OxidimseEnvOptions, ScpSettings, TimeoutSettings, get_config};
pub use status::{Status, StatusKind};

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use dicom::object::InMemDicomObject;
use tokio_util::sync::CancellationToken;

use crate::directory_store::DirectoryStore;
use crate::get_config;
use crate::server::Acceptor;
use crate::services::standard_registry;
use crate::settings::OxidimseEnvOptions;

/// Calls [run] using configuration from environment variables.
///
/// `finite_connections`: shut down the server after the given number of DICOM associations.
pub async fn run_from_env(
    finite_connections: Option<usize>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let settings = get_config().extract()?;
    run(settings, finite_connections, shutdown).await
}

/// Serve Verification, Storage, Query/Retrieve and Storage Commitment from the DICOM files
/// under `files_root`.
pub async fn run(
    settings: OxidimseEnvOptions,
    finite_connections: Option<usize>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ae = Arc::new(settings.ae_context());
    let store = Arc::new(DirectoryStore::new(settings.files_root));
    let registry = standard_registry::<InMemDicomObject, _>(store);
    let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.listener_port);
    let acceptor = Acceptor::bind(address, ae, registry).await?;
    acceptor.run(finite_connections, shutdown).await?;
    Ok(())
}

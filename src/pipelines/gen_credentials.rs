// src/pipelines/gen_credentials.rs: the gen_credentials module

use std::path::Path;
use std::sync::Arc;
use log::info;
use crate::config::defs::PipelineError;
use crate::utils::credentials::{write_token_file, Credential, CredentialProvider, Scope};


/// Issues a credential for `scope` and leaves its token in `key_out`,
/// readable only by the current user. Unlike a run's lease, the file is
/// kept for the caller.
///
/// # Arguments
///
/// * `provider` - Credential provider in front of the configured issuer.
/// * `scope` - Buckets and permissions to request.
/// * `key_out` - Destination of the token.
///
/// # Returns
/// The issued credential; its token is redacted when printed.
pub async fn run(provider: Arc<CredentialProvider>, scope: &Scope, key_out: &Path) -> Result<Credential, PipelineError> {
    let credential = provider.acquire(scope).await?;
    if let Some(parent) = key_out.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_token_file(key_out, &credential.token)?;
    info!(
        "Wrote access token for {} to {} (expires {})",
        credential.scope,
        key_out.display(),
        credential.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(credential)
}

use super::{exit_code, install_cancel_handler, load_config, CommandError};
use ocilaunch_core::CancelToken;
use ocilaunch_runtime::execution::{is_userns_child, wait_for_userns_mapping, MAPPING_TIMEOUT};
use ocilaunch_runtime::OciRuntime;
use std::path::Path;
use tracing::debug;

const SELF_UID_MAP: &str = "/proc/self/uid_map";

/// Invoke the OCI runtime directly on a finalized bundle. This is what the
/// launcher re-executes inside a new user namespace; a re-executed child
/// first waits for its parent to write the ID maps.
pub fn run(config: Option<&Path>, bundle: &Path, container_id: &str) -> Result<u8, CommandError> {
    if is_userns_child() {
        debug!("waiting for user namespace ID mappings");
        wait_for_userns_mapping(Path::new(SELF_UID_MAP), MAPPING_TIMEOUT)?;
    }

    let config = load_config(config)?;
    let runtime = OciRuntime::from_config(&config)?;

    let cancel = CancelToken::new();
    install_cancel_handler(&cancel);

    let outcome = runtime.run(bundle, container_id, &cancel)?;
    Ok(exit_code(outcome))
}

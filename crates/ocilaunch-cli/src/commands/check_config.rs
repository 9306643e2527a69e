use super::{load_config, CommandError, EXIT_FAILURE, EXIT_SUCCESS};
use ocilaunch_runtime::oci::find_runtime;
use ocilaunch_runtime::{check_prereqs, format_missing, HostIdentity};
use std::path::Path;

/// Load the configuration and report anything a launch by this user would
/// be missing.
pub fn run(config: Option<&Path>, json_output: bool) -> Result<u8, CommandError> {
    let config = load_config(config)?;
    let host = HostIdentity::current(&config)?;
    let missing = check_prereqs(&config, &host);
    let runtime = find_runtime(&config).ok();

    if json_output {
        let report = serde_json::json!({
            "uid": host.uid,
            "user": host.username,
            "runtime": runtime.as_ref().map(|p| p.display().to_string()),
            "systemd_cgroups": config.systemd_cgroups,
            "missing": missing
                .iter()
                .map(|m| serde_json::json!({
                    "name": m.name,
                    "purpose": m.purpose,
                    "install_hint": m.install_hint,
                }))
                .collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| CommandError::failure(format!("JSON serialization failed: {e}")))?;
        println!("{text}");
    } else if missing.is_empty() {
        if let Some(runtime) = &runtime {
            println!("runtime: {}", runtime.display());
        }
        println!("ready to launch containers as {} (uid {})", host.username, host.uid);
    } else {
        eprintln!("{}", format_missing(&missing));
    }

    Ok(if missing.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

//! Caller-supplied configuration overrides.
//!
//! A commit can adjust the image configuration on its way out, without
//! touching the working container: a Docker-format config whose set fields
//! are merged over the snapshot, and a list of instruction-style change
//! directives (`ENV k=v`, `ENTRYPOINT ["..."]`, ...). Both are applied to
//! the Docker and OCI documents together so dual-format parity survives the
//! override.
//!
//! This is deliberately not a build-file parser: only the directive forms
//! below are accepted, and anything else is rejected.

use std::collections::HashMap;

use oci_spec::image::Config as OciConfig;

use crate::docker::{Empty, Port, PortSet, Schema2Config};
use crate::error::{CommitError, Result};

/// Apply `override_config` and then each of `changes` to both runtime
/// configurations.
pub(crate) fn apply_overrides(
    dconfig: &mut Schema2Config,
    oconfig: &mut OciConfig,
    changes: &[String],
    override_config: Option<&Schema2Config>,
) -> Result<()> {
    if let Some(over) = override_config {
        merge_config(dconfig, oconfig, over);
    }
    for change in changes {
        apply_change(dconfig, oconfig, change)
            .map_err(|e| CommitError::Config(format!("applying change {change:?}: {e}")))?;
    }
    Ok(())
}

fn merge_config(dconfig: &mut Schema2Config, oconfig: &mut OciConfig, over: &Schema2Config) {
    if !over.hostname.is_empty() {
        dconfig.hostname = over.hostname.clone();
    }
    if !over.domainname.is_empty() {
        dconfig.domainname = over.domainname.clone();
    }
    if !over.user.is_empty() {
        dconfig.user = over.user.clone();
        oconfig.set_user(Some(over.user.clone()));
    }
    if let Some(env) = &over.env {
        dconfig.env = Some(env.clone());
        oconfig.set_env(Some(env.clone()));
    }
    if let Some(cmd) = &over.cmd {
        dconfig.cmd = Some(cmd.clone());
        oconfig.set_cmd(Some(cmd.clone()));
    }
    if let Some(entrypoint) = &over.entrypoint {
        dconfig.entrypoint = Some(entrypoint.clone());
        oconfig.set_entrypoint(Some(entrypoint.clone()));
    }
    if let Some(ports) = &over.exposed_ports {
        dconfig.exposed_ports = Some(ports.clone());
        oconfig.set_exposed_ports(Some(ports.keys().map(|p| p.0.clone()).collect()));
    }
    if let Some(volumes) = &over.volumes {
        dconfig.volumes = Some(volumes.clone());
        oconfig.set_volumes(Some(volumes.keys().cloned().collect()));
    }
    if let Some(labels) = &over.labels {
        dconfig.labels = Some(labels.clone());
        oconfig.set_labels(Some(labels.clone().into_iter().collect::<HashMap<_, _>>()));
    }
    if !over.working_dir.is_empty() {
        dconfig.working_dir = over.working_dir.clone();
        oconfig.set_working_dir(Some(over.working_dir.clone()));
    }
    if !over.stop_signal.is_empty() {
        dconfig.stop_signal = over.stop_signal.clone();
        oconfig.set_stop_signal(Some(over.stop_signal.clone()));
    }
    if let Some(on_build) = &over.on_build {
        dconfig.on_build = Some(on_build.clone());
    }
    if let Some(shell) = &over.shell {
        dconfig.shell = Some(shell.clone());
    }
    if let Some(health) = &over.healthcheck {
        dconfig.healthcheck = Some(health.clone());
    }
    if let Some(stop_timeout) = over.stop_timeout {
        dconfig.stop_timeout = Some(stop_timeout);
    }
    if !over.image.is_empty() {
        dconfig.image = over.image.clone();
    }
    if !over.mac_address.is_empty() {
        dconfig.mac_address = over.mac_address.clone();
    }
    for (flag, value) in [
        (&mut dconfig.attach_stdin, over.attach_stdin),
        (&mut dconfig.attach_stdout, over.attach_stdout),
        (&mut dconfig.attach_stderr, over.attach_stderr),
        (&mut dconfig.tty, over.tty),
        (&mut dconfig.open_stdin, over.open_stdin),
        (&mut dconfig.stdin_once, over.stdin_once),
        (&mut dconfig.network_disabled, over.network_disabled),
        (&mut dconfig.args_escaped, over.args_escaped),
    ] {
        if value {
            *flag = true;
        }
    }
}

/// Parse `ENTRYPOINT`/`CMD`/`SHELL`-style arguments: an exec-form JSON
/// array, or a shell form wrapped in `/bin/sh -c`.
fn command_list(args: &str) -> Result<Vec<String>> {
    let args = args.trim();
    if args.starts_with('[') {
        Ok(serde_json::from_str(args)?)
    } else {
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            args.to_string(),
        ])
    }
}

/// Split a `k=v` or `k v` argument into key and value.
fn key_value(args: &str) -> Result<(String, String)> {
    let args = args.trim();
    if let Some((k, v)) = args.split_once('=') {
        return Ok((k.to_string(), v.to_string()));
    }
    if let Some((k, v)) = args.split_once(char::is_whitespace) {
        return Ok((k.to_string(), v.trim_start().to_string()));
    }
    Err(CommitError::Config(format!(
        "expected a key and a value, got {args:?}"
    )))
}

fn apply_change(dconfig: &mut Schema2Config, oconfig: &mut OciConfig, change: &str) -> Result<()> {
    let change = change.trim();
    let (instruction, args) = change
        .split_once(char::is_whitespace)
        .unwrap_or((change, ""));
    match instruction.to_ascii_uppercase().as_str() {
        "ENV" => {
            let (k, v) = key_value(args)?;
            let entry = format!("{k}={v}");
            let prefix = format!("{k}=");
            let mut env = oconfig.env().clone().unwrap_or_default();
            env.retain(|e| !e.starts_with(&prefix));
            env.push(entry);
            dconfig.env = Some(env.clone());
            oconfig.set_env(Some(env));
        }
        "LABEL" => {
            let (k, v) = key_value(args)?;
            let mut labels = oconfig.labels().clone().unwrap_or_default();
            labels.insert(k, v);
            dconfig.labels = Some(labels.clone().into_iter().collect());
            oconfig.set_labels(Some(labels));
        }
        "USER" => {
            dconfig.user = args.trim().to_string();
            oconfig.set_user(Some(args.trim().to_string()));
        }
        "WORKDIR" => {
            dconfig.working_dir = args.trim().to_string();
            oconfig.set_working_dir(Some(args.trim().to_string()));
        }
        "ENTRYPOINT" => {
            let list = command_list(args)?;
            dconfig.entrypoint = Some(list.clone());
            oconfig.set_entrypoint(Some(list));
        }
        "CMD" => {
            let list = command_list(args)?;
            dconfig.cmd = Some(list.clone());
            oconfig.set_cmd(Some(list));
        }
        "EXPOSE" => {
            let port = args.trim();
            let port = if port.contains('/') {
                port.to_string()
            } else {
                format!("{port}/tcp")
            };
            let mut ports = oconfig.exposed_ports().clone().unwrap_or_default();
            if !ports.iter().any(|existing| existing == &port) {
                ports.push(port.clone());
            }
            oconfig.set_exposed_ports(Some(ports));
            dconfig
                .exposed_ports
                .get_or_insert_with(PortSet::new)
                .insert(Port(port), Empty {});
        }
        "VOLUME" => {
            let volume = args.trim().to_string();
            let mut volumes = oconfig.volumes().clone().unwrap_or_default();
            if !volumes.iter().any(|existing| existing == &volume) {
                volumes.push(volume.clone());
            }
            oconfig.set_volumes(Some(volumes));
            dconfig
                .volumes
                .get_or_insert_with(Default::default)
                .insert(volume, Empty {});
        }
        "STOPSIGNAL" => {
            dconfig.stop_signal = args.trim().to_string();
            oconfig.set_stop_signal(Some(args.trim().to_string()));
        }
        "ONBUILD" => {
            dconfig
                .on_build
                .get_or_insert_with(Vec::new)
                .push(args.trim().to_string());
        }
        "SHELL" => {
            dconfig.shell = Some(command_list(args)?);
        }
        other => {
            return Err(CommitError::Config(format!(
                "unrecognized change instruction {other:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (Schema2Config, OciConfig) {
        (Schema2Config::default(), OciConfig::default())
    }

    #[test]
    fn test_env_and_label_changes_mirror() {
        let (mut d, mut o) = configs();
        apply_overrides(
            &mut d,
            &mut o,
            &["ENV FOO=bar".to_string(), "LABEL team=web".to_string()],
            None,
        )
        .unwrap();
        assert_eq!(d.env.as_ref().unwrap(), &vec!["FOO=bar".to_string()]);
        assert_eq!(o.env().clone().unwrap(), vec!["FOO=bar".to_string()]);
        assert_eq!(d.labels.as_ref().unwrap()["team"], "web");
        assert_eq!(o.labels().clone().unwrap()["team"], "web");
    }

    #[test]
    fn test_entrypoint_exec_and_shell_forms() {
        let (mut d, mut o) = configs();
        apply_overrides(
            &mut d,
            &mut o,
            &["ENTRYPOINT [\"/bin/app\", \"--serve\"]".to_string()],
            None,
        )
        .unwrap();
        assert_eq!(
            d.entrypoint.as_ref().unwrap(),
            &vec!["/bin/app".to_string(), "--serve".to_string()]
        );

        apply_overrides(&mut d, &mut o, &["CMD echo hi".to_string()], None).unwrap();
        assert_eq!(
            d.cmd.as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
        assert_eq!(o.cmd().clone().unwrap(), d.cmd.clone().unwrap());
    }

    #[test]
    fn test_expose_defaults_to_tcp() {
        let (mut d, mut o) = configs();
        apply_overrides(&mut d, &mut o, &["EXPOSE 8080".to_string()], None).unwrap();
        assert!(d
            .exposed_ports
            .as_ref()
            .unwrap()
            .contains_key(&Port::from("8080/tcp")));
        assert_eq!(
            o.exposed_ports().clone().unwrap(),
            vec!["8080/tcp".to_string()]
        );
    }

    #[test]
    fn test_unknown_instruction_is_rejected() {
        let (mut d, mut o) = configs();
        let err = apply_overrides(&mut d, &mut o, &["FROM scratch".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, CommitError::Config(_)));
    }

    #[test]
    fn test_override_config_merges_set_fields() {
        let (mut d, mut o) = configs();
        d.user = "root".to_string();
        let mut over = Schema2Config::default();
        over.user = "app".to_string();
        over.env = Some(vec!["MODE=prod".to_string()]);
        over.tty = true;
        apply_overrides(&mut d, &mut o, &[], Some(&over)).unwrap();
        assert_eq!(d.user, "app");
        assert_eq!(o.user().clone().unwrap(), "app");
        assert_eq!(d.env.as_ref().unwrap(), &vec!["MODE=prod".to_string()]);
        assert!(d.tty);
        // Unset override fields leave the target alone.
        assert!(d.working_dir.is_empty());
    }
}

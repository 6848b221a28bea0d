//! Mirrored configuration accessors.
//!
//! Every setter here keeps the OCI and Docker configuration documents in
//! lockstep: fields that exist in both formats are written to both, fields
//! that exist in only one format are written to the owning document and
//! silently dropped when the other format is produced. Getters for slice
//! and map fields return copies; mutating a returned value never affects
//! the model.
//!
//! Docker-only fields: hostname, domain name, image comment, `ONBUILD`
//! triggers, and the default shell. OCI-only: manifest annotations.

use std::collections::HashMap;

use crate::container::{oci_arch, oci_os, WorkingContainer};
use crate::docker::{Empty, Port, PortSet, Schema2Config};

/// Expand `$name` and `${name}` references in `value` using `lookup`.
///
/// Mirrors the shell-style expansion the commit path has always used: a
/// lone `$` or a `$` followed by a non-name character is kept verbatim.
pub(crate) fn expand(value: &str, lookup: impl Fn(&str) -> String) -> String {
    fn is_name_start(b: u8) -> bool {
        b.is_ascii_alphabetic() || b == b'_'
    }
    fn is_name_char(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_'
    }

    let bytes = value.as_bytes();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            let next = value[i..].find('$').map_or(bytes.len(), |j| i + j);
            out.push_str(&value[i..next]);
            i = next;
        } else if bytes.get(i + 1) == Some(&b'{') {
            match value[i + 2..].find('}') {
                Some(end) => {
                    out.push_str(&lookup(&value[i + 2..i + 2 + end]));
                    i += end + 3;
                }
                None => {
                    out.push('$');
                    i += 1;
                }
            }
        } else if bytes.get(i + 1).copied().is_some_and(is_name_start) {
            let mut j = i + 1;
            while j < bytes.len() && is_name_char(bytes[j]) {
                j += 1;
            }
            out.push_str(&lookup(&value[i + 1..j]));
            i = j;
        } else {
            out.push('$');
            i += 1;
        }
    }
    out
}

impl WorkingContainer {
    fn with_oci_config<F: FnOnce(&mut oci_spec::image::Config)>(&mut self, f: F) {
        let mut config = self.oci.config().clone().unwrap_or_default();
        f(&mut config);
        self.oci.set_config(Some(config));
    }

    fn docker_config_mut(&mut self) -> &mut Schema2Config {
        self.docker.config.get_or_insert_with(Schema2Config::default)
    }

    fn docker_config(&self) -> Schema2Config {
        self.docker.config.clone().unwrap_or_default()
    }

    /// Key-value pairs from the image's manifest.
    pub fn annotations(&self) -> HashMap<String, String> {
        self.image_annotations.clone()
    }

    /// Add or overwrite a key's value in the image's manifest.
    ///
    /// This setting is not present in the Docker v2 image format, so it is
    /// discarded when writing images using Docker v2 formats.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.image_annotations
            .insert(key.to_string(), value.to_string());
    }

    /// Remove a key and its value from the image's manifest, if present.
    pub fn unset_annotation(&mut self, key: &str) {
        self.image_annotations.remove(key);
    }

    /// Remove all keys and their values from the image's manifest.
    pub fn clear_annotations(&mut self) {
        self.image_annotations.clear();
    }

    /// A description of how this image was built.
    pub fn created_by(&self) -> String {
        self.image_created_by.clone()
    }

    /// Set the description of how this image was built.
    pub fn set_created_by(&mut self, how: &str) {
        self.image_created_by = how.to_string();
    }

    /// The comment to use in the history entry describing this commit.
    pub fn history_comment(&self) -> String {
        self.image_history_comment.clone()
    }

    /// Set the comment to use in the history entry describing this commit.
    pub fn set_history_comment(&mut self, comment: &str) {
        self.image_history_comment = comment.to_string();
    }

    /// The OS the image is intended to run on.
    pub fn os(&self) -> String {
        self.oci.os().to_string()
    }

    /// Set the OS the image is intended to run on.
    pub fn set_os(&mut self, os: &str) {
        self.oci.set_os(oci_os(os));
        self.docker.os = os.to_string();
    }

    /// The architecture the image is intended to run on.
    pub fn architecture(&self) -> String {
        self.oci.architecture().to_string()
    }

    /// Set the architecture the image is intended to run on.
    pub fn set_architecture(&mut self, arch: &str) {
        self.oci.set_architecture(oci_arch(arch));
        self.docker.architecture = arch.to_string();
    }

    /// Contact information for the person who built the image.
    pub fn maintainer(&self) -> String {
        self.oci.author().clone().unwrap_or_default()
    }

    /// Set contact information for the person who built the image.
    pub fn set_maintainer(&mut self, who: &str) {
        self.oci.set_author(Some(who.to_string()));
        self.docker.author = who.to_string();
    }

    /// The user commands run as.
    pub fn user(&self) -> String {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.user().clone())
            .unwrap_or_default()
    }

    /// Set the user commands run as: a user name or ID, optionally followed
    /// by a colon and a group name or ID.
    pub fn set_user(&mut self, spec: &str) {
        let spec = spec.to_string();
        self.with_oci_config(|c| {
            c.set_user(Some(spec.clone()));
        });
        self.docker_config_mut().user = spec;
    }

    /// The `ONBUILD` triggers recorded for the image.
    pub fn on_build(&self) -> Vec<String> {
        self.docker_config().on_build.unwrap_or_default()
    }

    /// Append an `ONBUILD` trigger to run when the image is used as a base.
    ///
    /// This setting is not present in the OCI v1 image format, so it is
    /// discarded when writing images using OCI v1 formats.
    pub fn set_onbuild(&mut self, on_build: &str) {
        self.docker_config_mut()
            .on_build
            .get_or_insert_with(Vec::new)
            .push(on_build.to_string());
    }

    /// Remove all `ONBUILD` triggers.
    pub fn clear_onbuild(&mut self) {
        self.docker_config_mut().on_build = Some(Vec::new());
    }

    /// The default working directory for commands.
    pub fn work_dir(&self) -> String {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.working_dir().clone())
            .unwrap_or_default()
    }

    /// Set the default working directory for commands.
    pub fn set_work_dir(&mut self, there: &str) {
        let there = there.to_string();
        self.with_oci_config(|c| {
            c.set_working_dir(Some(there.clone()));
        });
        self.docker_config_mut().working_dir = there;
    }

    /// The default shell for commands.
    pub fn shell(&self) -> Vec<String> {
        self.docker_config().shell.unwrap_or_default()
    }

    /// Set the default shell for commands.
    ///
    /// This setting is not present in the OCI v1 image format, so it is
    /// discarded when writing images using OCI v1 formats.
    pub fn set_shell(&mut self, shell: &[String]) {
        self.docker_config_mut().shell = Some(shell.to_vec());
    }

    /// The environment entries set when running commands.
    pub fn env(&self) -> Vec<String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default()
    }

    /// Add or overwrite an environment entry in both configurations.
    ///
    /// The value is shell-expanded against the environment list as it was
    /// before this call. Expansion of a variable with no matching entry
    /// yields the variable's *name*, not an empty string; callers have come
    /// to depend on that fallback.
    pub fn set_env(&mut self, k: &str, v: &str) {
        let pre_env = self.env();
        let expanded = expand(v, |name| {
            pre_env
                .iter()
                .find_map(|entry| {
                    entry
                        .split_once('=')
                        .filter(|(key, _)| *key == name)
                        .map(|(_, value)| value.to_string())
                })
                .unwrap_or_else(|| name.to_string())
        });
        let entry = format!("{k}={expanded}");
        let prefix = format!("{k}=");
        self.with_oci_config(|c| {
            let mut env = c.env().clone().unwrap_or_default();
            env.retain(|e| !e.starts_with(&prefix));
            env.push(entry.clone());
            c.set_env(Some(env));
        });
        let env = self.docker_config_mut().env.get_or_insert_with(Vec::new);
        env.retain(|e| !e.starts_with(&prefix));
        env.push(entry);
    }

    /// Remove an environment entry from both configurations.
    pub fn unset_env(&mut self, k: &str) {
        let prefix = format!("{k}=");
        self.with_oci_config(|c| {
            let mut env = c.env().clone().unwrap_or_default();
            env.retain(|e| !e.starts_with(&prefix));
            c.set_env(Some(env));
        });
        if let Some(env) = self.docker_config_mut().env.as_mut() {
            env.retain(|e| !e.starts_with(&prefix));
        }
    }

    /// Remove all environment entries from both configurations.
    pub fn clear_env(&mut self) {
        self.with_oci_config(|c| {
            c.set_env(Some(Vec::new()));
        });
        self.docker_config_mut().env = Some(Vec::new());
    }

    /// The default command (or arguments to the entry point).
    pub fn cmd(&self) -> Vec<String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.cmd().clone())
            .unwrap_or_default()
    }

    /// Set the default command (or arguments to the entry point).
    pub fn set_cmd(&mut self, cmd: &[String]) {
        let cmd = cmd.to_vec();
        self.with_oci_config(|c| {
            c.set_cmd(Some(cmd.clone()));
        });
        self.docker_config_mut().cmd = Some(cmd);
    }

    /// The entry point for containers based on the image.
    pub fn entrypoint(&self) -> Vec<String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default()
    }

    /// Set the entry point for containers based on the image.
    pub fn set_entrypoint(&mut self, ep: &[String]) {
        let ep = ep.to_vec();
        self.with_oci_config(|c| {
            c.set_entrypoint(Some(ep.clone()));
        });
        self.docker_config_mut().entrypoint = Some(ep);
    }

    /// Key-value pairs from the image's runtime configuration.
    pub fn labels(&self) -> HashMap<String, String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .unwrap_or_default()
    }

    /// Add or overwrite a label in both configurations.
    pub fn set_label(&mut self, k: &str, v: &str) {
        self.with_oci_config(|c| {
            let mut labels = c.labels().clone().unwrap_or_default();
            labels.insert(k.to_string(), v.to_string());
            c.set_labels(Some(labels));
        });
        self.docker_config_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(k.to_string(), v.to_string());
    }

    /// Remove a label from both configurations, if present.
    pub fn unset_label(&mut self, k: &str) {
        self.with_oci_config(|c| {
            let mut labels = c.labels().clone().unwrap_or_default();
            labels.remove(k);
            c.set_labels(Some(labels));
        });
        if let Some(labels) = self.docker_config_mut().labels.as_mut() {
            labels.remove(k);
        }
    }

    /// Remove all labels from both configurations.
    pub fn clear_labels(&mut self) {
        self.with_oci_config(|c| {
            c.set_labels(Some(HashMap::new()));
        });
        self.docker_config_mut().labels = Some(Default::default());
    }

    /// The ports to expose when a container based on the image runs.
    pub fn ports(&self) -> Vec<String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.exposed_ports().clone())
            .unwrap_or_default()
    }

    /// Add a port to the exposed set in both configurations. The Docker
    /// side uses a typed port key, the OCI side a plain string.
    pub fn set_port(&mut self, p: &str) {
        self.with_oci_config(|c| {
            let mut ports = c.exposed_ports().clone().unwrap_or_default();
            if !ports.iter().any(|existing| existing == p) {
                ports.push(p.to_string());
            }
            c.set_exposed_ports(Some(ports));
        });
        self.docker_config_mut()
            .exposed_ports
            .get_or_insert_with(PortSet::new)
            .insert(Port::from(p), Empty {});
    }

    /// Remove a port from the exposed set in both configurations.
    pub fn unset_port(&mut self, p: &str) {
        self.with_oci_config(|c| {
            let mut ports = c.exposed_ports().clone().unwrap_or_default();
            ports.retain(|existing| existing != p);
            c.set_exposed_ports(Some(ports));
        });
        if let Some(ports) = self.docker_config_mut().exposed_ports.as_mut() {
            ports.remove(&Port::from(p));
        }
    }

    /// Empty the exposed-ports set in both configurations.
    pub fn clear_ports(&mut self) {
        self.with_oci_config(|c| {
            c.set_exposed_ports(Some(Vec::new()));
        });
        self.docker_config_mut().exposed_ports = Some(PortSet::new());
    }

    /// The locations to mount from outside the container.
    pub fn volumes(&self) -> Vec<String> {
        self.oci
            .config()
            .as_ref()
            .and_then(|c| c.volumes().clone())
            .unwrap_or_default()
    }

    /// Add a volume location in both configurations.
    pub fn add_volume(&mut self, v: &str) {
        self.with_oci_config(|c| {
            let mut volumes = c.volumes().clone().unwrap_or_default();
            if !volumes.iter().any(|existing| existing == v) {
                volumes.push(v.to_string());
            }
            c.set_volumes(Some(volumes));
        });
        self.docker_config_mut()
            .volumes
            .get_or_insert_with(Default::default)
            .insert(v.to_string(), Empty {});
    }

    /// Remove a volume location from both configurations.
    pub fn remove_volume(&mut self, v: &str) {
        self.with_oci_config(|c| {
            let mut volumes = c.volumes().clone().unwrap_or_default();
            volumes.retain(|existing| existing != v);
            c.set_volumes(Some(volumes));
        });
        if let Some(volumes) = self.docker_config_mut().volumes.as_mut() {
            volumes.remove(v);
        }
    }

    /// Empty the volume list in both configurations.
    pub fn clear_volumes(&mut self) {
        self.with_oci_config(|c| {
            c.set_volumes(Some(Vec::new()));
        });
        self.docker_config_mut().volumes = Some(Default::default());
    }

    /// The hostname set in containers based on the image.
    pub fn hostname(&self) -> String {
        self.docker_config().hostname
    }

    /// Set the hostname for containers based on the image.
    ///
    /// This setting is not present in the OCI v1 image format, so it is
    /// discarded when writing images using OCI v1 formats.
    pub fn set_hostname(&mut self, name: &str) {
        self.docker_config_mut().hostname = name.to_string();
    }

    /// The domain name set in containers based on the image.
    pub fn domainname(&self) -> String {
        self.docker_config().domainname
    }

    /// Set the domain name for containers based on the image.
    ///
    /// This setting is not present in the OCI v1 image format, so it is
    /// discarded when writing images using OCI v1 formats.
    pub fn set_domainname(&mut self, name: &str) {
        self.docker_config_mut().domainname = name.to_string();
    }

    /// The image-level comment.
    pub fn comment(&self) -> String {
        self.docker.comment.clone()
    }

    /// Set the image-level comment.
    ///
    /// This setting is not present in the OCI v1 image format, so it is
    /// discarded when writing images using OCI v1 formats.
    pub fn set_comment(&mut self, comment: &str) {
        self.docker.comment = comment.to_string();
    }

    /// The signal used to stop containers based on the image.
    pub fn stop_signal(&self) -> String {
        self.docker_config().stop_signal
    }

    /// Set the signal used to stop containers based on the image.
    pub fn set_stop_signal(&mut self, stop_signal: &str) {
        let stop_signal = stop_signal.to_string();
        self.with_oci_config(|c| {
            c.set_stop_signal(Some(stop_signal.clone()));
        });
        self.docker_config_mut().stop_signal = stop_signal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> WorkingContainer {
        let mut c = WorkingContainer::new("ctr").unwrap();
        c.initialize(None).unwrap();
        c
    }

    #[test]
    fn test_expand_basic() {
        let lookup = |name: &str| match name {
            "FOO" => "bar".to_string(),
            other => other.to_string(),
        };
        assert_eq!(expand("$FOO", lookup), "bar");
        assert_eq!(expand("${FOO}/bin", lookup), "bar/bin");
        assert_eq!(expand("a$FOO.b", lookup), "abar.b");
        assert_eq!(expand("no vars", lookup), "no vars");
        assert_eq!(expand("trailing $", lookup), "trailing $");
        assert_eq!(expand("$ alone", lookup), "$ alone");
    }

    #[test]
    fn test_set_env_expands_against_previous_env() {
        let mut c = container();
        c.set_env("PATH", "/usr/bin");
        c.set_env("PATH", "/opt/bin:$PATH");
        assert_eq!(c.env(), vec!["PATH=/opt/bin:/usr/bin".to_string()]);
    }

    #[test]
    fn test_set_env_unset_variable_expands_to_its_name() {
        let mut c = container();
        c.set_env("X", "$MISSING");
        assert_eq!(c.env(), vec!["X=MISSING".to_string()]);
    }

    #[test]
    fn test_set_env_replaces_existing_entry() {
        let mut c = container();
        c.set_env("A", "1");
        c.set_env("B", "2");
        c.set_env("A", "3");
        assert_eq!(c.env(), vec!["B=2".to_string(), "A=3".to_string()]);
        // Both formats carry the same list.
        assert_eq!(
            c.docker.config.as_ref().unwrap().env.as_ref().unwrap(),
            &c.env()
        );
    }

    #[test]
    fn test_ports_mirror_both_formats() {
        let mut c = container();
        c.set_port("80/tcp");
        c.set_port("53/udp");
        c.set_port("80/tcp");
        let mut ports = c.ports();
        ports.sort();
        assert_eq!(ports, vec!["53/udp".to_string(), "80/tcp".to_string()]);
        let docker_ports = c
            .docker
            .config
            .as_ref()
            .unwrap()
            .exposed_ports
            .clone()
            .unwrap();
        assert_eq!(docker_ports.len(), 2);
        c.unset_port("80/tcp");
        assert_eq!(c.ports(), vec!["53/udp".to_string()]);
    }

    #[test]
    fn test_labels_and_volumes_mirror() {
        let mut c = container();
        c.set_label("team", "a");
        c.add_volume("/data");
        assert_eq!(c.labels()["team"], "a");
        assert_eq!(c.volumes(), vec!["/data".to_string()]);
        let dc = c.docker.config.clone().unwrap();
        assert_eq!(dc.labels.unwrap()["team"], "a");
        assert!(dc.volumes.unwrap().contains_key("/data"));
        c.unset_label("team");
        c.remove_volume("/data");
        assert!(c.labels().is_empty());
        assert!(c.volumes().is_empty());
    }

    #[test]
    fn test_docker_only_fields_stay_docker_side() {
        let mut c = container();
        c.set_hostname("h");
        c.set_domainname("d");
        c.set_comment("imported");
        c.set_shell(&["/bin/bash".to_string(), "-c".to_string()]);
        c.set_onbuild("RUN true");
        assert_eq!(c.hostname(), "h");
        assert_eq!(c.domainname(), "d");
        assert_eq!(c.comment(), "imported");
        assert_eq!(c.shell(), vec!["/bin/bash".to_string(), "-c".to_string()]);
        assert_eq!(c.on_build(), vec!["RUN true".to_string()]);
        // None of that leaks into the OCI document.
        let oci = serde_json::to_string(&c.oci).unwrap();
        assert!(!oci.contains("bash"));
        assert!(!oci.contains("RUN true"));
    }

    #[test]
    fn test_getters_return_copies() {
        let mut c = container();
        c.set_cmd(&["run".to_string()]);
        let mut cmd = c.cmd();
        cmd.push("extra".to_string());
        assert_eq!(c.cmd(), vec!["run".to_string()]);

        c.set_label("k", "v");
        let mut labels = c.labels();
        labels.insert("k2".to_string(), "v2".to_string());
        assert_eq!(c.labels().len(), 1);
    }

    #[test]
    fn test_mirrored_setters_keep_parity() {
        let mut c = container();
        c.set_user("1000:1000");
        c.set_work_dir("/srv");
        c.set_entrypoint(&["/entry".to_string()]);
        c.set_cmd(&["serve".to_string()]);
        c.set_stop_signal("SIGTERM");
        c.set_maintainer("dev@example.org");

        let oci = c.oci.config().clone().unwrap();
        let dc = c.docker.config.clone().unwrap();
        assert_eq!(oci.user().clone().unwrap(), dc.user);
        assert_eq!(oci.working_dir().clone().unwrap(), dc.working_dir);
        assert_eq!(oci.entrypoint().clone().unwrap(), dc.entrypoint.unwrap());
        assert_eq!(oci.cmd().clone().unwrap(), dc.cmd.unwrap());
        assert_eq!(oci.stop_signal().clone().unwrap(), dc.stop_signal);
        assert_eq!(c.oci.author().clone().unwrap(), c.docker.author);
    }
}

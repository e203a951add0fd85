//! Cluster kubeconfig retrieval and merging
//!
//! Retrieval copies `/etc/rancher/rke2/rke2.yaml` out of the control-plane VM
//! and points it at the VM's routable address. Merging registers that cluster
//! as a named context in the operator's long-lived kubeconfig through
//! `kubectl config`, keeping certificate material in files rather than inline.

use crate::exec::CommandRunner;
use crate::kubectl::Kubectl;
use crate::multipass::Multipass;
use crate::provision::KUBECONFIG_PATH;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use yaml_rust::{Yaml, YamlLoader};

const API_PORT: u16 = 6443;
const LOOPBACK_SERVERS: [&str; 2] = ["127.0.0.1:6443", "localhost:6443"];
const CREDENTIAL_FILES: [&str; 3] = ["ca.crt", "client.crt", "client.key"];

/// Point the two loopback API endpoints RKE2 writes at `ip`; everything else
/// is left byte-for-byte intact
pub fn rewrite_server_address(content: &str, ip: &str) -> String {
    let replacement = format!("{}:{}", ip, API_PORT);
    LOOPBACK_SERVERS
        .iter()
        .fold(content.to_string(), |acc, loopback| acc.replace(loopback, &replacement))
}

/// Copy the control plane's kubeconfig to `dest`, rewritten for `ip`
pub fn fetch_kubeconfig<R: CommandRunner>(
    multipass: &Multipass<R>,
    server: &str,
    ip: &str,
    dest: &Path,
) -> Result<()> {
    let raw = multipass
        .read_file(server, KUBECONFIG_PATH)
        .context("Failed to fetch cluster kubeconfig")?;

    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    write_with_mode(dest, rewrite_server_address(&raw, ip).as_bytes(), 0o600)
}

/// Create or replace `path` with `mode` applied from the moment it exists
fn write_with_mode(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // `mode` only applies on creation; a file left by an earlier run keeps its old bits
    file.set_permissions(fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Name of the merged context for a control plane at `ip`
pub fn context_name(ip: &str) -> String {
    format!("rke2-{}", ip)
}

/// Name of the merged user for `context`
pub fn user_name(context: &str) -> String {
    format!("{}-admin", context)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    ClientCertificate {
        cert_path: PathBuf,
        cert: Vec<u8>,
        key_path: PathBuf,
        key: Vec<u8>,
    },
}

/// Everything needed to register one cluster as a context, resolved up front
/// so that nothing touches disk until the source is known to be usable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub context: String,
    pub user: String,
    pub server: String,
    /// CA file path and decoded PEM
    pub ca: Option<(PathBuf, Vec<u8>)>,
    pub credentials: Credentials,
    /// Per-context directory holding the files above
    pub credentials_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub context: String,
    pub activated: bool,
}

impl MergePlan {
    /// Build from a fetched kubeconfig. `source` only appears in diagnostics.
    pub fn from_kubeconfig(content: &str, source: &Path, ip: &str, credentials_root: &Path) -> Result<Self> {
        let docs = YamlLoader::load_from_str(content)
            .with_context(|| format!("{} is not valid YAML", source.display()))?;
        let doc = docs
            .first()
            .with_context(|| format!("{} is empty", source.display()))?;

        let cluster = &doc["clusters"][0]["cluster"];
        let user = &doc["users"][0]["user"];

        let server = cluster["server"]
            .as_str()
            .with_context(|| format!("No cluster server found in {}", source.display()))?
            .to_string();

        let context = context_name(ip);
        let dir = credentials_root.join(&context);

        let ca = decode_field(cluster, "certificate-authority-data", source)?
            .map(|pem| (dir.join("ca.crt"), pem));

        let credentials = match user["token"].as_str().filter(|t| !t.is_empty()) {
            Some(token) => Credentials::Token(token.to_string()),
            None => match (
                decode_field(user, "client-certificate-data", source)?,
                decode_field(user, "client-key-data", source)?,
            ) {
                (Some(cert), Some(key)) => Credentials::ClientCertificate {
                    cert_path: dir.join("client.crt"),
                    cert,
                    key_path: dir.join("client.key"),
                    key,
                },
                _ => anyhow::bail!(
                    "No usable credentials in {}: expected a user token or both \
                     client-certificate-data and client-key-data",
                    source.display()
                ),
            },
        };

        Ok(Self {
            user: user_name(&context),
            context,
            server,
            ca,
            credentials,
            credentials_dir: dir,
        })
    }

    /// Write credential files and register cluster, user and context.
    /// The context becomes current when `activate` is set or none is set yet.
    pub fn apply<R: CommandRunner>(&self, kubectl: &Kubectl<R>, activate: bool) -> Result<MergeOutcome> {
        if let Some(parent) = kubectl.kubeconfig().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.write_files()?;

        // Start from clean entries so a re-merge cannot keep stale CA or auth fields
        kubectl.config_best_effort(&["delete-cluster", self.context.as_str()]);
        kubectl.config_best_effort(&["delete-user", self.user.as_str()]);

        let server_flag = format!("--server={}", self.server);
        let ca_flag = self
            .ca
            .as_ref()
            .map(|(path, _)| format!("--certificate-authority={}", path.display()));
        let mut cluster_args = vec!["set-cluster", self.context.as_str(), server_flag.as_str()];
        if let Some(flag) = &ca_flag {
            cluster_args.push(flag.as_str());
        }
        kubectl.config(&cluster_args)?;

        match &self.credentials {
            Credentials::Token(token) => {
                let token_flag = format!("--token={}", token);
                kubectl.config(&["set-credentials", self.user.as_str(), token_flag.as_str()])?;
            }
            Credentials::ClientCertificate {
                cert_path, key_path, ..
            } => {
                let cert_flag = format!("--client-certificate={}", cert_path.display());
                let key_flag = format!("--client-key={}", key_path.display());
                kubectl.config(&[
                    "set-credentials",
                    self.user.as_str(),
                    cert_flag.as_str(),
                    key_flag.as_str(),
                ])?;
            }
        }

        let cluster_flag = format!("--cluster={}", self.context);
        let user_flag = format!("--user={}", self.user);
        kubectl.config(&[
            "set-context",
            self.context.as_str(),
            cluster_flag.as_str(),
            user_flag.as_str(),
        ])?;

        let activated = activate || kubectl.current_context()?.is_none();
        if activated {
            kubectl.config(&["use-context", self.context.as_str()])?;
        }

        Ok(MergeOutcome {
            context: self.context.clone(),
            activated,
        })
    }

    fn write_files(&self) -> Result<()> {
        let mut files: Vec<(&Path, &[u8], u32)> = Vec::new();
        if let Some((path, pem)) = &self.ca {
            files.push((path.as_path(), pem.as_slice(), 0o644));
        }
        if let Credentials::ClientCertificate {
            cert_path,
            cert,
            key_path,
            key,
        } = &self.credentials
        {
            files.push((cert_path.as_path(), cert.as_slice(), 0o644));
            files.push((key_path.as_path(), key.as_slice(), 0o600));
        }

        if !files.is_empty() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.credentials_dir)
                .with_context(|| format!("Failed to create {}", self.credentials_dir.display()))?;
        }
        for (path, content, mode) in &files {
            write_with_mode(path, content, *mode)?;
        }

        // Drop material a previous merge wrote that this plan no longer references
        for name in CREDENTIAL_FILES {
            let path = self.credentials_dir.join(name);
            if files.iter().any(|(kept, _, _)| *kept == path.as_path()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale credential file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

fn decode_field(node: &Yaml, field: &str, source: &Path) -> Result<Option<Vec<u8>>> {
    match node[field].as_str().map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(encoded) => STANDARD
            .decode(encoded)
            .map(Some)
            .with_context(|| format!("{} in {} is not valid base64", field, source.display())),
    }
}

/// Merge the kubeconfig at `source` into the file `kubectl` is bound to
pub fn merge_kubeconfig<R: CommandRunner>(
    kubectl: &Kubectl<R>,
    source: &Path,
    ip: &str,
    credentials_root: &Path,
    activate: bool,
) -> Result<MergeOutcome> {
    let content = fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    MergePlan::from_kubeconfig(&content, source, ip, credentials_root)?.apply(kubectl, activate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    fn cert_kubeconfig(with_ca: bool) -> String {
        let ca = if with_ca {
            format!("    certificate-authority-data: {}\n", b64("CA PEM"))
        } else {
            String::new()
        };
        format!(
            "apiVersion: v1\n\
             clusters:\n\
             - cluster:\n\
             {ca}    server: https://10.0.0.5:6443\n  \
             name: default\n\
             contexts:\n\
             - context:\n    cluster: default\n    user: default\n  name: default\n\
             current-context: default\n\
             kind: Config\n\
             users:\n\
             - name: default\n  \
             user:\n    \
             client-certificate-data: {cert}\n    \
             client-key-data: {key}\n",
            ca = ca,
            cert = b64("CERT PEM"),
            key = b64("KEY PEM"),
        )
    }

    const TOKEN_KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    server: https://10.0.0.5:6443
  name: default
users:
- name: default
  user:
    token: abc123
";

    #[test]
    fn test_rewrite_only_touches_loopback_endpoints() {
        let content = "\
clusters:
- cluster:
    server: https://127.0.0.1:6443
- cluster:
    server: https://localhost:6443
- cluster:
    server: https://127.0.0.1:9345
- cluster:
    server: https://kube.example.com:6443
";
        let rewritten = rewrite_server_address(content, "10.0.0.5");
        assert_eq!(
            rewritten,
            "\
clusters:
- cluster:
    server: https://10.0.0.5:6443
- cluster:
    server: https://10.0.0.5:6443
- cluster:
    server: https://127.0.0.1:9345
- cluster:
    server: https://kube.example.com:6443
"
        );
    }

    #[test]
    fn test_fetch_writes_rewritten_private_file() {
        let runner = FakeRunner::new().on(
            "multipass exec rke2-master -- sudo cat /etc/rancher/rke2/rke2.yaml",
            0,
            "server: https://127.0.0.1:6443\n",
        );
        let mp = Multipass::new(&runner, "multipass");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out").join("kubeconfig.yaml");

        fetch_kubeconfig(&mp, "rke2-master", "10.0.0.5", &dest).unwrap();
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "server: https://10.0.0.5:6443\n"
        );
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_rewriting_existing_file_tightens_its_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig.yaml");
        fs::write(&path, "old contents that are longer\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_with_mode(&path, b"new\n", 0o600).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_plan_with_ca_and_client_certificate() {
        let root = Path::new("/home/op/.kube/rke2");
        let plan =
            MergePlan::from_kubeconfig(&cert_kubeconfig(true), Path::new("k.yaml"), "10.0.0.5", root)
                .unwrap();
        assert_eq!(plan.context, "rke2-10.0.0.5");
        assert_eq!(plan.user, "rke2-10.0.0.5-admin");
        assert_eq!(plan.server, "https://10.0.0.5:6443");
        assert_eq!(
            plan.ca,
            Some((root.join("rke2-10.0.0.5").join("ca.crt"), b"CA PEM".to_vec()))
        );
        match plan.credentials {
            Credentials::ClientCertificate { cert, key, key_path, .. } => {
                assert_eq!(cert, b"CERT PEM");
                assert_eq!(key, b"KEY PEM");
                assert_eq!(key_path, root.join("rke2-10.0.0.5").join("client.key"));
            }
            other => panic!("unexpected credentials: {:?}", other),
        }
    }

    #[test]
    fn test_token_preferred_and_no_ca() {
        let plan = MergePlan::from_kubeconfig(
            TOKEN_KUBECONFIG,
            Path::new("k.yaml"),
            "10.0.0.5",
            Path::new("/x"),
        )
        .unwrap();
        assert_eq!(plan.ca, None);
        assert_eq!(plan.credentials, Credentials::Token("abc123".to_string()));
    }

    #[test]
    fn test_token_wins_over_malformed_certificate() {
        let content = format!(
            "{}    client-certificate-data: not*base64\n    client-key-data: {}\n",
            TOKEN_KUBECONFIG,
            b64("KEY PEM")
        );
        let plan =
            MergePlan::from_kubeconfig(&content, Path::new("k.yaml"), "10.0.0.5", Path::new("/x"))
                .unwrap();
        assert_eq!(plan.credentials, Credentials::Token("abc123".to_string()));
    }

    #[test]
    fn test_malformed_certificate_without_token_fails() {
        let content = cert_kubeconfig(false).replace(&b64("CERT PEM"), "not*base64");
        let err = MergePlan::from_kubeconfig(&content, Path::new("k.yaml"), "10.0.0.5", Path::new("/x"))
            .unwrap_err();
        assert!(err.to_string().contains("client-certificate-data"));
    }

    #[test]
    fn test_missing_credentials_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("fetched.yaml");
        fs::write(
            &source,
            "clusters:\n- cluster:\n    server: https://10.0.0.5:6443\nusers:\n- name: default\n  user:\n    client-certificate-data: Q0VSVA==\n",
        )
        .unwrap();

        let runner = FakeRunner::new();
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        let creds_root = dir.path().join("rke2");
        let err = merge_kubeconfig(&kubectl, &source, "10.0.0.5", &creds_root, false).unwrap_err();

        assert!(err.to_string().contains("fetched.yaml"));
        assert!(!creds_root.exists());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_apply_writes_files_and_registers_context() {
        let dir = tempfile::tempdir().unwrap();
        let creds_root = dir.path().join("rke2");
        let plan = MergePlan::from_kubeconfig(
            &cert_kubeconfig(true),
            Path::new("k.yaml"),
            "10.0.0.5",
            &creds_root,
        )
        .unwrap();

        let runner = FakeRunner::new();
        let target = dir.path().join("kube").join("config");
        let kubectl = Kubectl::new(&runner, &target);
        let outcome = plan.apply(&kubectl, false).unwrap();

        let ctx_dir = creds_root.join("rke2-10.0.0.5");
        assert_eq!(fs::read(ctx_dir.join("ca.crt")).unwrap(), b"CA PEM");
        assert_eq!(fs::read(ctx_dir.join("client.crt")).unwrap(), b"CERT PEM");
        let key_mode = fs::metadata(ctx_dir.join("client.key"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(key_mode, 0o600);
        assert!(target.parent().unwrap().is_dir());

        let prefix = format!("kubectl --kubeconfig {} config ", target.display());
        let lines: Vec<String> = runner
            .command_lines()
            .iter()
            .map(|l| l.trim_start_matches(&prefix).to_string())
            .collect();
        assert!(lines.contains(&format!(
            "set-cluster rke2-10.0.0.5 --server=https://10.0.0.5:6443 --certificate-authority={}",
            ctx_dir.join("ca.crt").display()
        )));
        assert!(lines.contains(&format!(
            "set-credentials rke2-10.0.0.5-admin --client-certificate={} --client-key={}",
            ctx_dir.join("client.crt").display(),
            ctx_dir.join("client.key").display()
        )));
        assert!(lines.contains(
            &"set-context rke2-10.0.0.5 --cluster=rke2-10.0.0.5 --user=rke2-10.0.0.5-admin"
                .to_string()
        ));
        // current-context succeeded with empty output, so nothing was set yet
        assert!(outcome.activated);
    }

    #[test]
    fn test_cluster_without_ca_has_no_ca_reference() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MergePlan::from_kubeconfig(
            TOKEN_KUBECONFIG,
            Path::new("k.yaml"),
            "10.0.0.5",
            &dir.path().join("rke2"),
        )
        .unwrap();
        let runner = FakeRunner::new();
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        plan.apply(&kubectl, false).unwrap();

        let set_cluster: Vec<String> = runner
            .command_lines()
            .into_iter()
            .filter(|l| l.contains("set-cluster"))
            .collect();
        assert_eq!(set_cluster.len(), 1);
        assert!(!set_cluster[0].contains("certificate-authority"));
        assert!(!dir.path().join("rke2").exists());
    }

    #[test]
    fn test_existing_context_not_hijacked_unless_requested() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MergePlan::from_kubeconfig(
            TOKEN_KUBECONFIG,
            Path::new("k.yaml"),
            "10.0.0.5",
            &dir.path().join("rke2"),
        )
        .unwrap();

        let runner = FakeRunner::new().on(
            &format!(
                "kubectl --kubeconfig {} config current-context",
                dir.path().join("config").display()
            ),
            0,
            "work-cluster\n",
        );
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        let outcome = plan.apply(&kubectl, false).unwrap();
        assert!(!outcome.activated);
        assert!(!runner.command_lines().iter().any(|l| l.contains("use-context")));

        let outcome = plan.apply(&kubectl, true).unwrap();
        assert!(outcome.activated);
        assert!(runner.command_lines().iter().any(|l| l.ends_with("use-context rke2-10.0.0.5")));
    }

    #[test]
    fn test_remerge_targets_same_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rke2");
        let runner = FakeRunner::new();
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        let source = dir.path().join("fetched.yaml");
        fs::write(&source, cert_kubeconfig(true)).unwrap();

        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();
        let first = runner.command_lines();
        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();
        let second = runner.command_lines()[first.len()..].to_vec();

        assert_eq!(first, second);
        assert!(first[0].ends_with("delete-cluster rke2-10.0.0.5"));
        assert!(first[1].ends_with("delete-user rke2-10.0.0.5-admin"));
        let entries: Vec<_> = fs::read_dir(root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remerge_with_token_removes_old_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rke2");
        let runner = FakeRunner::new();
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        let source = dir.path().join("fetched.yaml");
        let ctx_dir = root.join("rke2-10.0.0.5");

        fs::write(&source, cert_kubeconfig(true)).unwrap();
        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();
        assert!(ctx_dir.join("client.key").exists());

        fs::write(&source, TOKEN_KUBECONFIG).unwrap();
        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();
        for name in ["ca.crt", "client.crt", "client.key"] {
            assert!(!ctx_dir.join(name).exists(), "{} left behind", name);
        }
    }

    #[test]
    fn test_remerge_without_ca_keeps_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rke2");
        let runner = FakeRunner::new();
        let kubectl = Kubectl::new(&runner, dir.path().join("config"));
        let source = dir.path().join("fetched.yaml");
        let ctx_dir = root.join("rke2-10.0.0.5");

        fs::write(&source, cert_kubeconfig(true)).unwrap();
        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();
        fs::write(&source, cert_kubeconfig(false)).unwrap();
        merge_kubeconfig(&kubectl, &source, "10.0.0.5", &root, false).unwrap();

        assert!(!ctx_dir.join("ca.crt").exists());
        assert_eq!(fs::read(ctx_dir.join("client.crt")).unwrap(), b"CERT PEM");
        assert_eq!(fs::read(ctx_dir.join("client.key")).unwrap(), b"KEY PEM");
    }
}

//! Account credential materialization.
//!
//! Account objects reference Secrets for their creds file and TLS material.
//! The NATS client only takes file paths, so the referenced keys are written
//! to `<cache-dir>/<namespace>/<account>/<key>` with mode 0600 and the
//! resulting paths are placed in the account's [`ConnectionConfig`].

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::Account;
use jetstream_client::ConnectionConfig;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Reads one key of a Secret
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, ControllerError>;
}

/// [`SecretReader`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl fmt::Debug for KubeSecretReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSecretReader").finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?.ok_or_else(|| {
            ControllerError::Credentials(format!("secret {}/{} not found", namespace, name))
        })?;
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| bytes.0)
            .ok_or_else(|| {
                ControllerError::Credentials(format!(
                    "secret {}/{} has no key {:?}",
                    namespace, name, key
                ))
            })
    }
}

/// Writes Account secrets to disk and builds their connection settings
pub struct CredentialStore {
    reader: Arc<dyn SecretReader>,
    root: PathBuf,
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(reader: Arc<dyn SecretReader>, root: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            root: root.into(),
        }
    }

    /// Cache directory of one account
    pub fn account_dir(&self, namespace: &str, account: &str) -> PathBuf {
        self.root.join(namespace).join(account)
    }

    /// Connection settings for `account`.
    ///
    /// An account listing its own servers connects with its own credentials
    /// only. Otherwise it starts from `global` and overrides whatever the
    /// account specifies. Returns `None` when neither names a server.
    pub async fn account_config(
        &self,
        account: &Account,
        global: Option<&ConnectionConfig>,
    ) -> Result<Option<ConnectionConfig>, ControllerError> {
        let namespace = account.namespace().unwrap_or_default();
        let name = account.name_any();

        let mut config = if account.spec.servers.is_empty() {
            match global {
                Some(global) => {
                    let mut config = global.clone();
                    config.tls_first |= account.spec.tls_first;
                    config
                }
                None => return Ok(None),
            }
        } else {
            let mut config = ConnectionConfig::new(account.spec.servers.clone());
            if let Some(global) = global {
                config.client_name = global.client_name.clone();
                config.request_timeout = global.request_timeout;
            }
            config.tls_first = account.spec.tls_first;
            config
        };

        if let Some(creds) = &account.spec.creds {
            let path = self
                .materialize(&namespace, &name, &creds.secret.name, &creds.file)
                .await?;
            config.credentials_file = Some(path);
            config.nkey_seed_file = None;
        }

        if let Some(tls) = &account.spec.tls {
            if let Some(cert) = &tls.client_cert {
                config.tls_client_cert =
                    Some(self.materialize(&namespace, &name, &tls.secret.name, cert).await?);
            }
            if let Some(key) = &tls.client_key {
                config.tls_client_key =
                    Some(self.materialize(&namespace, &name, &tls.secret.name, key).await?);
            }
            if !tls.root_cas.is_empty() {
                let mut roots = Vec::with_capacity(tls.root_cas.len());
                for ca in &tls.root_cas {
                    roots.push(self.materialize(&namespace, &name, &tls.secret.name, ca).await?);
                }
                config.tls_root_cas = roots;
            }
        }

        Ok(Some(config))
    }

    /// Write one secret key below the account directory, returning its path
    async fn materialize(
        &self,
        namespace: &str,
        account: &str,
        secret: &str,
        key: &str,
    ) -> Result<PathBuf, ControllerError> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(ControllerError::Credentials(format!(
                "invalid secret key {:?} for account {}/{}",
                key, namespace, account
            )));
        }
        let data = self.reader.read(namespace, secret, key).await?;
        let dir = self.account_dir(namespace, account);
        let path = dir.join(key);
        write_if_changed(&dir, &path, &data).await?;
        Ok(path)
    }

    /// Remove the cached files of a deleted account
    pub async fn remove(&self, namespace: &str, account: &str) -> Result<(), ControllerError> {
        match tokio::fs::remove_dir_all(self.account_dir(namespace, account)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

async fn write_if_changed(dir: &Path, path: &Path, data: &[u8]) -> Result<(), ControllerError> {
    if let Ok(existing) = tokio::fs::read(path).await
        && existing == data
    {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    debug!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{StaticSecrets, create_test_account};
    use crds::{CredsSecret, SecretReference, TlsSecret};

    fn store(secrets: StaticSecrets, root: &Path) -> CredentialStore {
        CredentialStore::new(Arc::new(secrets), root)
    }

    #[tokio::test]
    async fn test_account_without_servers_uses_global() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(StaticSecrets::default(), dir.path());
        let account = create_test_account("acct-a", "default");
        let global = ConnectionConfig::new(vec!["nats://global:4222".to_string()]);

        let config = store.account_config(&account, Some(&global)).await.unwrap().unwrap();
        assert_eq!(config, global);

        assert!(store.account_config(&account, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_creds_materialized_with_private_mode() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = StaticSecrets::default();
        secrets.insert("default", "acct-a-creds", "user.creds", b"-----BEGIN NATS USER JWT-----");
        let store = store(secrets, dir.path());

        let mut account = create_test_account("acct-a", "default");
        account.spec.servers = vec!["nats://acct:4222".to_string()];
        account.spec.creds = Some(CredsSecret {
            secret: SecretReference::new("acct-a-creds"),
            file: "user.creds".to_string(),
        });

        let global = ConnectionConfig {
            credentials_file: Some("/global.creds".into()),
            ..ConnectionConfig::new(vec!["nats://global:4222".to_string()])
        };
        let config = store.account_config(&account, Some(&global)).await.unwrap().unwrap();

        let expected = dir.path().join("default").join("acct-a").join("user.creds");
        assert_eq!(config.servers, vec!["nats://acct:4222"]);
        assert_eq!(config.credentials_file.as_deref(), Some(expected.as_path()));
        assert_eq!(
            std::fs::read(&expected).unwrap(),
            b"-----BEGIN NATS USER JWT-----".to_vec()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&expected).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = StaticSecrets::default();
        secrets.insert("nats", "tls", "tls.crt", b"cert");
        secrets.insert("nats", "tls", "tls.key", b"key");
        secrets.insert("nats", "tls", "ca.crt", b"ca");
        let store = store(secrets, dir.path());

        let mut account = create_test_account("acct-b", "nats");
        account.spec.tls = Some(TlsSecret {
            secret: SecretReference::new("tls"),
            client_cert: Some("tls.crt".to_string()),
            client_key: Some("tls.key".to_string()),
            root_cas: vec!["ca.crt".to_string()],
        });
        account.spec.tls_first = true;
        let global = ConnectionConfig::new(vec!["tls://global:4222".to_string()]);

        let config = store.account_config(&account, Some(&global)).await.unwrap().unwrap();
        let base = dir.path().join("nats").join("acct-b");
        assert_eq!(config.tls_client_cert, Some(base.join("tls.crt")));
        assert_eq!(config.tls_client_key, Some(base.join("tls.key")));
        assert_eq!(config.tls_root_cas, vec![base.join("ca.crt")]);
        assert!(config.tls_first);
    }

    #[tokio::test]
    async fn test_missing_secret_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(StaticSecrets::default(), dir.path());
        let mut account = create_test_account("acct-a", "default");
        account.spec.creds = Some(CredsSecret {
            secret: SecretReference::new("absent"),
            file: "user.creds".to_string(),
        });
        let global = ConnectionConfig::new(vec!["nats://global:4222".to_string()]);

        let err = store.account_config(&account, Some(&global)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_key_cannot_escape_account_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(StaticSecrets::default(), dir.path());
        let mut account = create_test_account("acct-a", "default");
        account.spec.creds = Some(CredsSecret {
            secret: SecretReference::new("s"),
            file: "../../etc/passwd".to_string(),
        });
        let global = ConnectionConfig::new(vec!["nats://global:4222".to_string()]);

        let err = store.account_config(&account, Some(&global)).await.unwrap_err();
        assert!(matches!(err, ControllerError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = StaticSecrets::default();
        secrets.insert("default", "s", "user.creds", b"x");
        let store = store(secrets, dir.path());
        let mut account = create_test_account("acct-a", "default");
        account.spec.creds = Some(CredsSecret {
            secret: SecretReference::new("s"),
            file: "user.creds".to_string(),
        });
        let global = ConnectionConfig::new(vec!["nats://global:4222".to_string()]);
        store.account_config(&account, Some(&global)).await.unwrap();

        store.remove("default", "acct-a").await.unwrap();
        assert!(!store.account_dir("default", "acct-a").exists());
        store.remove("default", "acct-a").await.unwrap();
    }
}

//! ConfigStore: owner of the persisted configuration document.
//!
//! Writers serialize on an internal mutex and persist with write-new-then-rename
//! before publishing. Readers take `Arc<EffectiveConfig>` snapshots from a watch
//! channel without locking.

use crate::config::merge::MergeService;
use crate::config::schema;
use crate::config::sources::{ConfigLayer, LAYER_OVERRIDES, LAYER_PERSISTED};
use crate::config::{AgentSettings, ConfigDocument, EffectiveConfig, PolicyRecord};
use crate::error::ConfigError;
use crate::pairing::identity::{AgentIdentity, PairingStatus};
use chrono::Utc;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
struct StoreState {
    document: ConfigDocument,
    /// Keys set during this process; highest precedence layer
    overrides: BTreeMap<String, Value>,
}

/// Result of a `set` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOutcome {
    pub key: String,
    pub value: Value,
    /// False when the stored value was already equal; nothing was written.
    pub changed: bool,
}

/// Result of applying a console policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyOutcome {
    pub applied: Vec<String>,
    pub rejected: Vec<(String, String)>,
    pub changed: bool,
}

pub struct ConfigStore {
    path: PathBuf,
    /// Env-file and process environment layers, fixed for the process lifetime
    base_layers: Vec<ConfigLayer>,
    inner: Mutex<StoreState>,
    snapshot: watch::Sender<Arc<EffectiveConfig>>,
    recovered_from: Mutex<Option<PathBuf>>,
}

impl ConfigStore {
    /// Open the document at `path`, creating nothing until the first mutation.
    ///
    /// A document that cannot be parsed is preserved next to the original as
    /// `<name>.corrupt-<timestamp>` and replaced with a default document.
    pub fn open(path: impl Into<PathBuf>, base_layers: Vec<ConfigLayer>) -> Result<Self, ConfigError> {
        let path = path.into();
        let (document, recovered_from) = load_document(&path)?;
        let state = StoreState {
            document,
            overrides: BTreeMap::new(),
        };
        let effective = compute_effective(&state, &base_layers)?;
        let (snapshot, _) = watch::channel(Arc::new(effective));
        debug!(path = %path.display(), "Opened config store");
        Ok(Self {
            path,
            base_layers,
            inner: Mutex::new(state),
            snapshot,
            recovered_from: Mutex::new(recovered_from),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<EffectiveConfig> {
        self.snapshot.borrow().clone()
    }

    pub fn settings(&self) -> AgentSettings {
        self.snapshot().settings.clone()
    }

    pub fn identity(&self) -> Option<AgentIdentity> {
        self.snapshot().identity.clone()
    }

    /// Receiver notified after every committed mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EffectiveConfig>> {
        self.snapshot.subscribe()
    }

    /// Quarantine path if the document was found corrupt.
    pub fn recovered_from(&self) -> Option<PathBuf> {
        self.recovered_from.lock().clone()
    }

    /// Re-read the document from disk, keeping in-process overrides.
    pub fn reload(&self) -> Result<Arc<EffectiveConfig>, ConfigError> {
        let mut guard = self.inner.lock();
        let (document, recovered) = load_document(&self.path)?;
        let next = StoreState {
            document,
            overrides: guard.overrides.clone(),
        };
        let effective = Arc::new(compute_effective(&next, &self.base_layers)?);
        *guard = next;
        if recovered.is_some() {
            *self.recovered_from.lock() = recovered;
        }
        self.snapshot.send_replace(effective.clone());
        Ok(effective)
    }

    /// Coerce `raw` to the declared type of `key` and persist it.
    pub fn set(&self, key: &str, raw: &str) -> Result<SetOutcome, ConfigError> {
        let spec = schema::lookup(key)?;
        let value = spec.coerce(raw)?;
        let key = spec.key.to_string();
        let stored = value.clone();
        let changed = self.mutate(|state| {
            state.document.settings.insert(key.clone(), stored.clone());
            state.overrides.insert(key.clone(), stored);
            Ok(())
        })?;
        if changed {
            info!(key = %key, "Configuration value updated");
        }
        Ok(SetOutcome {
            key,
            value,
            changed,
        })
    }

    /// `KEY:VALUE` form of [`ConfigStore::set`].
    pub fn set_assignment(&self, assignment: &str) -> Result<SetOutcome, ConfigError> {
        let (key, raw) = schema::parse_assignment(assignment)?;
        self.set(&key, &raw)
    }

    /// Remove the persisted document and in-process overrides. Idempotent.
    ///
    /// Returns whether a document existed.
    pub fn clear(&self) -> Result<bool, ConfigError> {
        let mut guard = self.inner.lock();
        let next = StoreState::default();
        let effective = Arc::new(compute_effective(&next, &self.base_layers)?);
        let existed = remove_if_exists(&self.path)?;
        remove_if_exists(&tmp_path(&self.path))?;
        *guard = next;
        self.snapshot.send_replace(effective);
        if existed {
            info!(path = %self.path.display(), "Cleared persistent configuration");
        }
        Ok(existed)
    }

    pub fn save_identity(&self, identity: AgentIdentity) -> Result<(), ConfigError> {
        self.mutate(|state| {
            state.document.identity = Some(identity);
            Ok(())
        })?;
        Ok(())
    }

    /// Drop the identity and any recorded policy. Returns the removed identity.
    pub fn clear_identity(&self) -> Result<Option<AgentIdentity>, ConfigError> {
        let mut removed = None;
        self.mutate(|state| {
            removed = state.document.identity.take();
            state.document.policy = None;
            Ok(())
        })?;
        Ok(removed)
    }

    /// Update the stored identity status. No-op without an identity.
    pub fn set_identity_status(&self, status: PairingStatus) -> Result<bool, ConfigError> {
        self.mutate(|state| {
            if let Some(identity) = state.document.identity.as_mut() {
                identity.status = status;
            }
            Ok(())
        })
    }

    /// Validate and persist console policy settings as one mutation.
    ///
    /// Unknown keys and invalid values are skipped with a warning. Policy
    /// values replace in-process overrides for the same keys.
    pub fn apply_policy(
        &self,
        record: PolicyRecord,
        settings: &serde_json::Map<String, Value>,
    ) -> Result<PolicyOutcome, ConfigError> {
        let mut outcome = PolicyOutcome::default();
        let mut validated = BTreeMap::new();
        for (key, value) in settings {
            match schema::lookup(key).and_then(|spec| spec.validate(value).map(|v| (spec, v))) {
                Ok((spec, v)) => {
                    validated.insert(spec.key.to_string(), v);
                    outcome.applied.push(spec.key.to_string());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping policy setting");
                    outcome.rejected.push((key.clone(), e.to_string()));
                }
            }
        }

        outcome.changed = self.mutate(|state| {
            for (key, value) in validated {
                state.overrides.remove(&key);
                state.document.settings.insert(key, value);
            }
            state.document.policy = Some(record);
            Ok(())
        })?;
        Ok(outcome)
    }

    pub fn view(&self) -> ConfigView {
        ConfigView {
            effective: self.snapshot(),
            path: self.path.clone(),
            recovered_from: self.recovered_from(),
        }
    }

    /// Apply `change` to a copy of the state, persist if the document changed,
    /// then commit and publish. Returns whether anything changed.
    fn mutate<F>(&self, change: F) -> Result<bool, ConfigError>
    where
        F: FnOnce(&mut StoreState) -> Result<(), ConfigError>,
    {
        let mut guard = self.inner.lock();
        let mut next = guard.clone();
        change(&mut next)?;

        let document_changed = next.document != guard.document;
        if !document_changed && next.overrides == guard.overrides {
            return Ok(false);
        }

        let effective = Arc::new(compute_effective(&next, &self.base_layers)?);
        if document_changed {
            write_document(&self.path, &next.document)?;
        }
        *guard = next;
        self.snapshot.send_replace(effective);
        Ok(true)
    }
}

fn compute_effective(
    state: &StoreState,
    base_layers: &[ConfigLayer],
) -> Result<EffectiveConfig, ConfigError> {
    let mut layers = Vec::with_capacity(base_layers.len() + 3);
    layers.push(ConfigLayer::defaults()?);
    layers.push(ConfigLayer::new(
        LAYER_PERSISTED,
        state.document.settings.clone(),
    ));
    layers.extend(base_layers.iter().cloned());
    layers.push(ConfigLayer::new(LAYER_OVERRIDES, state.overrides.clone()));

    let merged = MergeService::merge(&layers)?;
    Ok(EffectiveConfig {
        settings: merged.settings,
        identity: state.document.identity.clone(),
        policy: state.document.policy.clone(),
        origins: merged.origins,
    })
}

fn load_document(path: &Path) -> Result<(ConfigDocument, Option<PathBuf>), ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((ConfigDocument::default(), None))
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_str::<ConfigDocument>(&content) {
        Ok(document) => Ok((sanitize(document), None)),
        Err(e) => {
            let quarantine = quarantine(path)?;
            error!(
                path = %path.display(),
                preserved_as = %quarantine.display(),
                reason = %e,
                "Persisted configuration is corrupt, starting from defaults"
            );
            let document = ConfigDocument::default();
            write_document(path, &document)?;
            Ok((document, Some(quarantine)))
        }
    }
}

/// Drop stored settings that are no longer recognized or no longer valid.
fn sanitize(mut document: ConfigDocument) -> ConfigDocument {
    let stored = std::mem::take(&mut document.settings);
    for (key, value) in stored {
        match schema::lookup(&key).and_then(|spec| spec.validate(&value).map(|v| (spec, v))) {
            Ok((spec, v)) => {
                document.settings.insert(spec.key.to_string(), v);
            }
            Err(e) => warn!(key = %key, error = %e, "Ignoring stored setting"),
        }
    }
    document
}

fn quarantine(path: &Path) -> Result<PathBuf, ConfigError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| crate::config::CONFIG_FILE_NAME.to_string());
    let mut target = path.with_file_name(format!("{}.corrupt-{}", file_name, stamp));
    let mut n = 1;
    while target.exists() {
        target = path.with_file_name(format!("{}.corrupt-{}-{}", file_name, stamp, n));
        n += 1;
    }
    fs::rename(path, &target).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(target)
}

fn write_document(path: &Path, document: &ConfigDocument) -> Result<(), ConfigError> {
    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| ConfigError::Serialize(e.to_string()))?;
    write_atomic(path, &bytes)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write to `<path>.tmp`, fsync, restrict permissions, rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let io_error = |p: &Path| {
        let p = p.to_path_buf();
        move |source| ConfigError::Io { path: p, source }
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let tmp = tmp_path(path);
    {
        let mut options = fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(io_error(&tmp))?;
        file.write_all(bytes).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)).map_err(io_error(&tmp))?;
    }

    fs::rename(&tmp, path).map_err(io_error(path))?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool, ConfigError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read-only projection of the effective configuration. The pairing token is
/// masked in every rendering.
#[derive(Debug, Clone)]
pub struct ConfigView {
    pub effective: Arc<EffectiveConfig>,
    pub path: PathBuf,
    pub recovered_from: Option<PathBuf>,
}

impl ConfigView {
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Key", "Value", "Source"]);

        let settings = serde_json::to_value(&self.effective.settings).unwrap_or(Value::Null);
        for spec in schema::SETTINGS {
            let value = settings.get(spec.key).map(display_value).unwrap_or_default();
            table.add_row(vec![
                spec.key.to_string(),
                value,
                self.effective.origin(spec.key).to_string(),
            ]);
        }

        let mut output = format!("Configuration: {}\n", self.path.display());
        if let Some(quarantine) = &self.recovered_from {
            output.push_str(&format!(
                "Recovered from corrupt document, preserved at {}\n",
                quarantine.display()
            ));
        }
        output.push_str(&table.to_string());
        output.push('\n');

        match &self.effective.identity {
            Some(identity) => {
                let mut table = Table::new();
                table.load_preset(UTF8_BORDERS_ONLY);
                table.set_header(vec!["Identity", "Value"]);
                let groups = identity.groups.iter().cloned().collect::<Vec<_>>().join(", ");
                table.add_row(vec!["agent_id".to_string(), identity.agent_id.clone()]);
                table.add_row(vec!["console_url".to_string(), identity.console_url.clone()]);
                table.add_row(vec!["pairing_token".to_string(), identity.pairing_token.masked()]);
                table.add_row(vec!["groups".to_string(), groups]);
                table.add_row(vec!["paired_at".to_string(), identity.paired_at.to_rfc3339()]);
                table.add_row(vec!["status".to_string(), identity.status.to_string()]);
                if let Some(policy) = &self.effective.policy {
                    table.add_row(vec![
                        "policy".to_string(),
                        format!("revision {} ({})", policy.revision, policy.uuid),
                    ]);
                }
                output.push_str(&table.to_string());
            }
            None => output.push_str("Identity: not paired"),
        }
        output
    }

    /// JSON rendering with the token masked.
    pub fn to_json(&self) -> Value {
        let identity = self.effective.identity.as_ref().map(|identity| {
            serde_json::json!({
                "agent_id": identity.agent_id,
                "console_url": identity.console_url,
                "pairing_token": identity.pairing_token.masked(),
                "groups": identity.groups,
                "paired_at": identity.paired_at.to_rfc3339(),
                "status": identity.status.as_str(),
            })
        });
        serde_json::json!({
            "path": self.path.display().to_string(),
            "settings": self.effective.settings,
            "origins": self.effective.origins,
            "identity": identity,
            "policy": self.effective.policy,
        })
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|i| match i {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::identity::PairingToken;
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("persistent-config.json"), Vec::new()).unwrap()
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_id: "agent-42".to_string(),
            console_url: "https://console.example.test".to_string(),
            pairing_token: PairingToken::new("tok-0123456789abcdef"),
            groups: BTreeSet::from(["linux".to_string()]),
            paired_at: Utc::now(),
            status: PairingStatus::Paired,
        }
    }

    #[test]
    fn test_open_missing_file_yields_defaults_without_writing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert_eq!(store.settings().health_check_interval, 30);
        assert!(store.identity().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_round_trips_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.set("roles", "poller, detector").unwrap();
            store.set("health_check_interval", "12").unwrap();
            store.set("ignore_tls", "yes").unwrap();
            store
                .set("role_configs", r#"{"poller":{"wait_interval":3}}"#)
                .unwrap();
            store.set("name", "edge-01").unwrap();
        }
        let store = open(&dir);
        let settings = store.settings();
        assert_eq!(settings.roles, vec!["poller", "detector"]);
        assert_eq!(settings.health_check_interval, 12);
        assert!(settings.ignore_tls);
        assert_eq!(settings.role_config("poller")["wait_interval"], 3);
        assert_eq!(settings.name, "edge-01");
        assert_eq!(store.snapshot().origin("roles"), "persisted");
    }

    #[test]
    fn test_role_config_keys_keep_their_case() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store
                .set(
                    "role_configs",
                    r#"{"EdrPoller":{"maxInputs":3,"wait_interval":4}}"#,
                )
                .unwrap();
            assert_eq!(store.settings().role_config("EdrPoller")["maxInputs"], 3);
        }
        let settings = open(&dir).settings();
        let edr = settings.role_config("EdrPoller");
        assert_eq!(edr["maxInputs"], 3);
        assert_eq!(edr["wait_interval"], 4);
        assert!(edr.get("maxinputs").is_none());
    }

    #[test]
    fn test_set_same_value_twice_does_not_rewrite() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.set("replay_interval", "20").unwrap().changed);
        let before = fs::read(store.path()).unwrap();
        let modified = fs::metadata(store.path()).unwrap().modified().unwrap();

        let outcome = store.set("replay_interval", "20").unwrap();
        assert!(!outcome.changed);
        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert_eq!(
            fs::metadata(store.path()).unwrap().modified().unwrap(),
            modified
        );
    }

    #[test]
    fn test_set_rejects_bad_key_and_value() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let err = store.set("colour", "blue").unwrap_err();
        assert!(err.to_string().contains("'colour'"));
        assert!(matches!(
            store.set("replay_interval", "-1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_wins_over_environment_layers() {
        let dir = TempDir::new().unwrap();
        let env = ConfigLayer::new(
            "environment",
            BTreeMap::from([("replay_interval".to_string(), json!(99))]),
        );
        let store =
            ConfigStore::open(dir.path().join("persistent-config.json"), vec![env]).unwrap();
        assert_eq!(store.settings().replay_interval, 99);
        store.set("replay_interval", "7").unwrap();
        assert_eq!(store.settings().replay_interval, 7);
        assert_eq!(store.snapshot().origin("replay_interval"), "override");
    }

    #[test]
    fn test_clear_is_idempotent_and_removes_identity() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.save_identity(identity()).unwrap();
        store.set("roles", "poller").unwrap();

        assert!(store.clear().unwrap());
        assert!(!store.path().exists());
        assert!(store.identity().is_none());
        assert!(store.settings().roles.is_empty());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn test_corrupt_document_is_preserved_and_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persistent-config.json");
        fs::write(&path, "{ this is not json").unwrap();

        let store = ConfigStore::open(&path, Vec::new()).unwrap();
        let quarantine = store.recovered_from().expect("quarantine path");
        assert_eq!(fs::read_to_string(&quarantine).unwrap(), "{ this is not json");
        assert!(quarantine
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("persistent-config.json.corrupt-"));
        let fresh: ConfigDocument =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(fresh, ConfigDocument::default());
    }

    #[test]
    fn test_unknown_stored_keys_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persistent-config.json");
        fs::write(
            &path,
            r#"{"version":1,"settings":{"roles":["poller"],"legacy_key":"x"}}"#,
        )
        .unwrap();
        let store = ConfigStore::open(&path, Vec::new()).unwrap();
        assert!(store.recovered_from().is_none());
        assert_eq!(store.settings().roles, vec!["poller"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_document_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.save_identity(identity()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!tmp_path(store.path()).exists());
    }

    #[test]
    fn test_view_masks_token() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.save_identity(identity()).unwrap();
        let view = store.view();
        let table = view.render_table();
        assert!(table.contains("agent-42"));
        assert!(!table.contains("tok-0123456789abcdef"));
        assert!(!view.to_json().to_string().contains("tok-0123456789abcdef"));
    }

    #[test]
    fn test_view_without_identity_or_optional_keys() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let table = store.view().render_table();
        assert!(table.contains("not paired"));
        assert!(table.contains("health_check_interval"));
    }

    #[test]
    fn test_apply_policy_validates_each_setting() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.set("roles", "poller").unwrap();
        let settings = json!({
            "roles": ["detector"],
            "health_check_interval": 0,
            "unknown": true
        });
        let outcome = store
            .apply_policy(
                PolicyRecord {
                    revision: 3,
                    uuid: "p-1".to_string(),
                },
                settings.as_object().unwrap(),
            )
            .unwrap();
        assert_eq!(outcome.applied, vec!["roles"]);
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome.changed);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.settings.roles, vec!["detector"]);
        assert_eq!(snapshot.settings.health_check_interval, 30);
        assert_eq!(snapshot.policy.as_ref().unwrap().revision, 3);
    }

    #[test]
    fn test_subscribers_see_committed_changes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut rx = store.subscribe();
        store.set("roles", "detector").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().settings.roles, vec!["detector"]);
    }

    #[test]
    fn test_identity_status_update() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(!store.set_identity_status(PairingStatus::Revoked).unwrap());
        store.save_identity(identity()).unwrap();
        assert!(store.set_identity_status(PairingStatus::Revoked).unwrap());
        assert_eq!(store.identity().unwrap().status, PairingStatus::Revoked);
        let removed = store.clear_identity().unwrap();
        assert_eq!(removed.unwrap().agent_id, "agent-42");
        assert!(store.identity().is_none());
    }
}

//! Restore/resume listener — applies a received master-key payload to
//! durable local state.
//!
//! The payload usually lands while the user sits on the pairing screen, but
//! it can just as well arrive mid-session (the partner re-sent it while this
//! device was already inside the app). Application is idempotent, and
//! anything that would desynchronize the two devices' keys is refused
//! before a single byte is persisted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::crypto::master::MasterKeyPayload;
use crate::{PairingDelegate, PairingError};

/// Settings keys owned by the pairing flow.
pub mod keys {
    /// This device's durable user identity.
    pub const LOCAL_ID: &str = "local_id";
    /// Long-term master key, base64.
    pub const MASTER_KEY: &str = "master_key";
    /// KDF salt, base64.
    pub const SALT: &str = "salt";
    /// The partner's user identity.
    pub const PARTNER_ID: &str = "partner_id";
    /// [`STATUS_CONNECTED`](super::STATUS_CONNECTED) once pairing completed.
    pub const PAIRING_STATUS: &str = "pairing_status";
}

/// Value of `pairing_status` once a pairing has been finalized.
pub const STATUS_CONNECTED: &str = "connected";

/// Key-value settings store the pairing flow persists into.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PairingError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PairingError>;
    fn remove(&self, key: &str) -> Result<(), PairingError>;
}

/// Bulk importer for essential records bundled with a pairing payload.
pub trait RecordImporter: Send + Sync {
    fn import_records(&self, store: &str, records: &[serde_json::Value])
        -> Result<(), PairingError>;
}

/// In-memory settings store for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct MemorySettings {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>, PairingError> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PairingError> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PairingError> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }
}

/// Sled-backed settings store.
pub struct SledSettings {
    db: sled::Db,
}

impl SledSettings {
    pub fn open(path: &str) -> Result<Self, PairingError> {
        let db = sled::open(path).map_err(|e| PairingError::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

impl SettingsStore for SledSettings {
    fn get(&self, key: &str) -> Result<Option<String>, PairingError> {
        let value = self
            .db
            .get(key.as_bytes())
            .map_err(|e| PairingError::Storage(e.to_string()))?;
        match value {
            Some(ivec) => String::from_utf8(ivec.to_vec())
                .map(Some)
                .map_err(|e| PairingError::Storage(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PairingError> {
        self.db
            .insert(key.as_bytes(), value.as_bytes())
            .map_err(|e| PairingError::Storage(e.to_string()))?;
        // Settings writes are rare and small; flush so "paired" is never
        // claimed before it is actually on disk.
        self.db
            .flush()
            .map_err(|e| PairingError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PairingError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| PairingError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// What applying a payload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Finalized a new pairing with this partner.
    Applied { partner_id: String },
    /// Same payload as the existing pairing; nothing to do.
    AlreadyApplied,
    /// Payload was not applicable here (no local identity yet, missing key
    /// material, or conflicting with an existing pairing).
    Ignored,
}

/// Applies master-key payloads to local state, wherever they arrive from.
pub struct RestoreListener {
    settings: Arc<dyn SettingsStore>,
    importer: Option<Arc<dyn RecordImporter>>,
    delegate: Option<Arc<dyn PairingDelegate>>,
}

impl RestoreListener {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            importer: None,
            delegate: None,
        }
    }

    /// Install the importer for bundled essential records.
    pub fn with_importer(mut self, importer: Arc<dyn RecordImporter>) -> Self {
        self.importer = Some(importer);
        self
    }

    /// Install the delegate notified when pairing completes.
    pub fn with_delegate(mut self, delegate: Arc<dyn PairingDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Apply a received master-key payload.
    ///
    /// Idempotent under duplicate delivery. Self-pairing and
    /// missing-identity payloads fail without touching persisted state.
    pub fn apply(&self, payload: &MasterKeyPayload) -> Result<RestoreOutcome, PairingError> {
        let Some(local_id) = self.settings.get(keys::LOCAL_ID)? else {
            tracing::debug!("restore payload ignored: no local identity yet");
            return Ok(RestoreOutcome::Ignored);
        };
        if payload.master_key.is_empty() || payload.salt.is_empty() {
            tracing::debug!("restore payload ignored: missing key material");
            return Ok(RestoreOutcome::Ignored);
        }

        // Resolve which side of the relationship this device is on.
        let partner_id = if local_id == payload.creator_id {
            &payload.joiner_id
        } else {
            &payload.creator_id
        };
        if partner_id.is_empty() {
            return Err(PairingError::MissingPartnerIdentity);
        }
        if *partner_id == local_id {
            return Err(PairingError::SelfPairingDetected);
        }

        let master_b64 = BASE64.encode(&payload.master_key);
        let salt_b64 = BASE64.encode(&payload.salt);

        if self.settings.get(keys::PAIRING_STATUS)?.as_deref() == Some(STATUS_CONNECTED) {
            if self.settings.get(keys::MASTER_KEY)?.as_deref() == Some(master_b64.as_str()) {
                tracing::debug!("restore payload already applied");
                return Ok(RestoreOutcome::AlreadyApplied);
            }
            // A different master key after pairing completed would fork the
            // two devices' encryption keys. Refuse it.
            tracing::warn!("restore payload conflicts with existing pairing, ignoring");
            return Ok(RestoreOutcome::Ignored);
        }

        // Effects, in order: records first, then keys, then status, then
        // the announcement. "Paired" is only ever claimed after the keys
        // are durably stored.
        if let Some(importer) = &self.importer {
            for batch in &payload.records {
                importer.import_records(&batch.store, &batch.records)?;
            }
        }

        self.settings.set(keys::MASTER_KEY, &master_b64)?;
        self.settings.set(keys::SALT, &salt_b64)?;
        self.settings.set(keys::PARTNER_ID, partner_id)?;
        self.settings.set(keys::PAIRING_STATUS, STATUS_CONNECTED)?;

        if let Some(delegate) = &self.delegate {
            delegate.on_peer_connected(partner_id);
        }

        tracing::info!(partner = %partner_id, "pairing finalized");
        Ok(RestoreOutcome::Applied {
            partner_id: partner_id.clone(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingImporter {
        imports: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingImporter {
        fn new() -> Self {
            Self {
                imports: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecordImporter for RecordingImporter {
        fn import_records(
            &self,
            store: &str,
            records: &[serde_json::Value],
        ) -> Result<(), PairingError> {
            self.imports
                .lock()
                .unwrap()
                .push((store.to_string(), records.len()));
            Ok(())
        }
    }

    struct RecordingDelegate {
        connected: Mutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn new() -> Self {
            Self {
                connected: Mutex::new(Vec::new()),
            }
        }
    }

    impl PairingDelegate for RecordingDelegate {
        fn on_peer_connected(&self, partner_id: &str) {
            self.connected.lock().unwrap().push(partner_id.to_string());
        }
    }

    fn payload() -> MasterKeyPayload {
        MasterKeyPayload::generate("creator-1", "joiner-1")
    }

    fn settings_with_identity(local_id: &str) -> Arc<MemorySettings> {
        let settings = Arc::new(MemorySettings::new());
        settings.set(keys::LOCAL_ID, local_id).unwrap();
        settings
    }

    #[test]
    fn test_ignored_without_local_identity() {
        let settings = Arc::new(MemorySettings::new());
        let listener = RestoreListener::new(settings.clone());

        let outcome = listener.apply(&payload()).unwrap();
        assert_eq!(outcome, RestoreOutcome::Ignored);
        assert!(settings.get(keys::MASTER_KEY).unwrap().is_none());
    }

    #[test]
    fn test_ignored_without_key_material() {
        let settings = settings_with_identity("joiner-1");
        let listener = RestoreListener::new(settings.clone());

        let mut bad = payload();
        bad.master_key.clear();

        let outcome = listener.apply(&bad).unwrap();
        assert_eq!(outcome, RestoreOutcome::Ignored);
        assert!(settings.get(keys::MASTER_KEY).unwrap().is_none());
    }

    #[test]
    fn test_apply_persists_everything_in_order() {
        let settings = settings_with_identity("joiner-1");
        let importer = Arc::new(RecordingImporter::new());
        let delegate = Arc::new(RecordingDelegate::new());
        let listener = RestoreListener::new(settings.clone())
            .with_importer(importer.clone())
            .with_delegate(delegate.clone());

        let payload = payload().with_records(vec![crate::crypto::master::RecordBatch {
            store: "memories".to_string(),
            records: vec![serde_json::json!({"id": 1})],
        }]);

        let outcome = listener.apply(&payload).unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Applied {
                partner_id: "creator-1".to_string()
            }
        );

        assert_eq!(
            settings.get(keys::MASTER_KEY).unwrap().unwrap(),
            BASE64.encode(&payload.master_key)
        );
        assert_eq!(
            settings.get(keys::SALT).unwrap().unwrap(),
            BASE64.encode(&payload.salt)
        );
        assert_eq!(
            settings.get(keys::PARTNER_ID).unwrap().unwrap(),
            "creator-1"
        );
        assert_eq!(
            settings.get(keys::PAIRING_STATUS).unwrap().unwrap(),
            STATUS_CONNECTED
        );
        assert_eq!(
            *importer.imports.lock().unwrap(),
            vec![("memories".to_string(), 1)]
        );
        assert_eq!(*delegate.connected.lock().unwrap(), vec!["creator-1"]);
    }

    #[test]
    fn test_creator_side_resolves_joiner_as_partner() {
        let settings = settings_with_identity("creator-1");
        let listener = RestoreListener::new(settings.clone());

        let outcome = listener.apply(&payload()).unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Applied {
                partner_id: "joiner-1".to_string()
            }
        );
        assert_eq!(settings.get(keys::PARTNER_ID).unwrap().unwrap(), "joiner-1");
    }

    #[test]
    fn test_duplicate_apply_is_idempotent() {
        let settings = settings_with_identity("joiner-1");
        let importer = Arc::new(RecordingImporter::new());
        let delegate = Arc::new(RecordingDelegate::new());
        let listener = RestoreListener::new(settings.clone())
            .with_importer(importer.clone())
            .with_delegate(delegate.clone());

        let payload = payload().with_records(vec![crate::crypto::master::RecordBatch {
            store: "memories".to_string(),
            records: vec![serde_json::json!({"id": 1})],
        }]);

        let first = listener.apply(&payload).unwrap();
        let master_after_first = settings.get(keys::MASTER_KEY).unwrap();

        let second = listener.apply(&payload).unwrap();
        assert!(matches!(first, RestoreOutcome::Applied { .. }));
        assert_eq!(second, RestoreOutcome::AlreadyApplied);

        // Same persisted state as applying once; records imported once;
        // announcement fired once.
        assert_eq!(settings.get(keys::MASTER_KEY).unwrap(), master_after_first);
        assert_eq!(importer.imports.lock().unwrap().len(), 1);
        assert_eq!(delegate.connected.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_self_pairing_rejected_and_state_untouched() {
        let settings = settings_with_identity("same-user");
        let listener = RestoreListener::new(settings.clone());

        let mut bad = payload();
        bad.creator_id = "same-user".to_string();
        bad.joiner_id = "same-user".to_string();

        let result = listener.apply(&bad);
        assert!(matches!(result, Err(PairingError::SelfPairingDetected)));
        assert!(settings.get(keys::MASTER_KEY).unwrap().is_none());
        assert!(settings.get(keys::PAIRING_STATUS).unwrap().is_none());
    }

    #[test]
    fn test_missing_partner_identity_rejected() {
        let settings = settings_with_identity("creator-1");
        let listener = RestoreListener::new(settings.clone());

        let mut bad = payload();
        bad.joiner_id = String::new();

        let result = listener.apply(&bad);
        assert!(matches!(result, Err(PairingError::MissingPartnerIdentity)));
        assert!(settings.get(keys::MASTER_KEY).unwrap().is_none());
    }

    #[test]
    fn test_conflicting_payload_after_pairing_is_ignored() {
        let settings = settings_with_identity("joiner-1");
        let listener = RestoreListener::new(settings.clone());

        listener.apply(&payload()).unwrap();
        let original = settings.get(keys::MASTER_KEY).unwrap();

        // A different creator shows up with different keys.
        let outcome = listener.apply(&payload()).unwrap();
        assert_eq!(outcome, RestoreOutcome::Ignored);
        assert_eq!(settings.get(keys::MASTER_KEY).unwrap(), original);
    }

    #[test]
    fn test_sled_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SledSettings::open(dir.path().to_str().unwrap()).unwrap();

        settings.set(keys::LOCAL_ID, "joiner-1").unwrap();
        assert_eq!(
            settings.get(keys::LOCAL_ID).unwrap().as_deref(),
            Some("joiner-1")
        );

        settings.remove(keys::LOCAL_ID).unwrap();
        assert!(settings.get(keys::LOCAL_ID).unwrap().is_none());
    }
}

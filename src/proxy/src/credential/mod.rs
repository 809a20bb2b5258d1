//! Encrypted, file-backed user→upstream-password mapping (spec §4.E).
//! Grounded on `examples/original_source/pkg/serverconfig/serverconfig.go`
//! (the slice-plus-index `Manager`/`Config` shape, CRUD semantics) with
//! AES-256-GCM encryption and regex user matching layered on top per
//! `spec.md` (the Go source's `serverconfig` variants are non-authoritative
//! scaffolding for this part — see `DESIGN.md`).

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::RngCore;
use regex::Regex;
use ring::aead::{self, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::admin::{ParsedQuery, Statement};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub const USER_COLUMN: &str = "User";
pub const PASSWORD_COLUMN: &str = "Password";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store io error: {0}")]
    Io(#[from] io::Error),
    #[error("credential store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("no update data")]
    NoUpdateData,
    #[error("not found data")]
    NotFoundData,
    #[error("already exists proxyUser: {0}")]
    AlreadyExists(String),
    #[error("column {0} not found")]
    UnknownColumn(String),
    #[error("where only supports equal operation")]
    WhereNotEqual,
}

/// One `(user_pattern, encrypted_password)` row, as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Password")]
    pub password: String,
}

/// On-disk schema: `{"Servers": [...], "Key": <base64 32-byte key>}`.
/// `key` is `None` until the first mutating write allocates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "Servers")]
    pub servers: Vec<Entry>,
    #[serde(rename = "Key", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Config {
    fn bootstrap(key: [u8; KEY_LEN]) -> Self {
        let password = encrypt(&key, b"pass");
        Config {
            servers: vec![Entry {
                user: "admin".to_string(),
                password,
            }],
            key: Some(STANDARD_NO_PAD.encode(key)),
        }
    }
}

struct OneShotNonce(Option<Nonce>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        self.0.take().ok_or(ring::error::Unspecified)
    }
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> String {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let unbound = UnboundKey::new(&AES_256_GCM, key).expect("32-byte key is valid for AES-256-GCM");
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let mut sealing = SealingKey::new(unbound, OneShotNonce(Some(nonce)));
    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
        .expect("sealing with a fresh nonce cannot fail");
    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);
    STANDARD_NO_PAD.encode(out)
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<String, CredentialError> {
    let raw = STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|_| CredentialError::MalformedCiphertext)?;
    if raw.len() < NONCE_LEN {
        return Err(CredentialError::MalformedCiphertext);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let mut nonce_arr = [0u8; NONCE_LEN];
    nonce_arr.copy_from_slice(nonce_bytes);
    let unbound = UnboundKey::new(&AES_256_GCM, key).expect("32-byte key is valid for AES-256-GCM");
    let nonce = Nonce::assume_unique_for_key(nonce_arr);
    let mut opening = OpeningKey::new(unbound, OneShotNonce(Some(nonce)));
    let mut in_out = ciphertext.to_vec();
    let plaintext = opening
        .open_in_place(aead::Aad::empty(), &mut in_out)
        .map_err(|_| CredentialError::DecryptionFailed)?;
    Ok(String::from_utf8_lossy(plaintext).into_owned())
}

fn decode_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
    let raw = STANDARD_NO_PAD.decode(encoded).ok()?;
    if raw.len() != KEY_LEN {
        return None;
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&raw);
    Some(key)
}

fn gen_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn normalize_column(column: &str) -> Result<&'static str, CredentialError> {
    match column.to_ascii_lowercase().as_str() {
        "user" => Ok(USER_COLUMN),
        "password" => Ok(PASSWORD_COLUMN),
        other => Err(CredentialError::UnknownColumn(other.to_string())),
    }
}

/// Default/explicit column list, substituting `[User, Password]` when the
/// statement carried none — spec §4.F.
fn effective_columns(parsed: &ParsedQuery) -> Result<Vec<&'static str>, CredentialError> {
    if parsed.columns.is_empty() {
        return Ok(vec![USER_COLUMN, PASSWORD_COLUMN]);
    }
    parsed.columns.iter().map(|c| normalize_column(c)).collect()
}

/// Splits `values` into `[User, Password]` pairs, striding by the column
/// count, for multi-row `INSERT`.
fn columns_to_entries(parsed: &ParsedQuery, key: &[u8; KEY_LEN]) -> Result<Vec<Entry>, CredentialError> {
    let columns = effective_columns(parsed)?;
    let mut out = Vec::new();
    for chunk in parsed.values.chunks(columns.len()) {
        if chunk.len() < columns.len() {
            return Err(CredentialError::UnknownColumn(
                "values length is less than columns length".to_string(),
            ));
        }
        let mut user = String::new();
        let mut password_plain = String::new();
        for (column, value) in columns.iter().zip(chunk.iter()) {
            match *column {
                USER_COLUMN => user = value.clone(),
                PASSWORD_COLUMN => password_plain = value.clone(),
                _ => unreachable!("effective_columns only yields known columns"),
            }
        }
        out.push(Entry {
            user,
            password: encrypt(key, password_plain.as_bytes()),
        });
    }
    Ok(out)
}

/// Resolves the equality `WHERE` clause into matching row indices.
/// Matching on `Password` compares against the *decrypted* plaintext,
/// since the clause values the admin user writes are always plaintext.
fn select_indices(
    parsed: &ParsedQuery,
    servers: &[Entry],
    key: &[u8; KEY_LEN],
) -> Result<Vec<usize>, CredentialError> {
    if parsed.where_columns.is_empty() {
        return Ok((0..servers.len()).collect());
    }
    if !parsed.where_op_is_eq() {
        return Err(CredentialError::WhereNotEqual);
    }
    let mut result: Vec<usize> = Vec::new();
    for (column, value) in parsed.where_columns.iter().zip(parsed.where_values.iter()) {
        let column = normalize_column(column)?;
        result = servers
            .iter()
            .enumerate()
            .filter(|(_, e)| match column {
                USER_COLUMN => &e.user == value,
                PASSWORD_COLUMN => decrypt(key, &e.password).map(|p| &p == value).unwrap_or(false),
                _ => unreachable!(),
            })
            .map(|(i, _)| i)
            .collect();
    }
    Ok(result)
}

/// Merges `SET`-assigned columns (an `UPDATE`'s `columns`/`values`) onto
/// an existing entry, re-encrypting the password if it changed.
fn apply_update(parsed: &ParsedQuery, current: &Entry, key: &[u8; KEY_LEN]) -> Result<Entry, CredentialError> {
    let columns = effective_columns(parsed)?;
    let current_password = decrypt(key, &current.password).unwrap_or_default();
    let mut user = current.user.clone();
    let mut password_plain = current_password;
    for (column, value) in columns.iter().zip(parsed.values.iter()) {
        match *column {
            USER_COLUMN => user = value.clone(),
            PASSWORD_COLUMN => password_plain = value.clone(),
            _ => unreachable!(),
        }
    }
    Ok(Entry {
        user,
        password: encrypt(key, password_plain.as_bytes()),
    })
}

fn result_columns(parsed: &ParsedQuery) -> Vec<String> {
    if parsed.columns.is_empty() {
        vec![USER_COLUMN.to_string(), PASSWORD_COLUMN.to_string()]
    } else {
        parsed
            .columns
            .iter()
            .map(|c| normalize_column(c).unwrap_or(USER_COLUMN).to_string())
            .collect()
    }
}

fn project_row(columns: &[String], entry: &Entry, plain_password: &str) -> Vec<String> {
    columns
        .iter()
        .map(|c| match c.as_str() {
            USER_COLUMN => entry.user.clone(),
            PASSWORD_COLUMN => plain_password.to_string(),
            _ => String::new(),
        })
        .collect()
}

/// Loads (or synthesizes) `Config` from `path` and keeps an in-memory
/// copy guarded by a single `RwLock`, matching spec §4.E/§5's resource
/// policy: disk I/O happens on a freshly read `Config`, the `RwLock`
/// only ever guards in-memory access. `write_gate` is a separate lock
/// that serializes the read-modify-write sequence of `insert`/`update`/
/// `delete` end to end (spec §5: "concurrent mutations serialize on the
/// write lock") without holding the `RwLock` across disk I/O.
pub struct CredentialStore {
    path: PathBuf,
    state: Arc<RwLock<Config>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = read_config(&path).unwrap_or_else(|| Config::bootstrap(gen_key()));
        CredentialStore {
            path,
            state: Arc::new(RwLock::new(config)),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn key_of(config: &Config) -> [u8; KEY_LEN] {
        config
            .key
            .as_deref()
            .and_then(decode_key)
            .unwrap_or_else(gen_key)
    }

    /// Rereads the file from disk, matching spec §4.E's "every admin
    /// statement reads the file fresh" lifecycle.
    async fn reload(&self) {
        if let Some(fresh) = read_config(&self.path) {
            *self.state.write().await = fresh;
        }
    }

    pub async fn get_config(&self) -> Config {
        self.reload().await;
        self.state.read().await.clone()
    }

    pub async fn put_config(&self, config: Config) -> Result<(), CredentialError> {
        write_config(&self.path, &config)?;
        *self.state.write().await = config;
        Ok(())
    }

    /// Looks up `username` against every stored pattern, compiling each
    /// as `^pattern$`; a pattern that fails to compile falls back to a
    /// literal comparison (spec §9 — the source silently downgrades this;
    /// we keep the behavior but log it at debug level).
    pub async fn lookup(&self, username: &str) -> Option<String> {
        self.reload().await;
        let config = self.state.read().await;
        let key = Self::key_of(&config);
        for entry in &config.servers {
            let matched = match Regex::new(&format!("^{}$", entry.user)) {
                Ok(re) => re.is_match(username),
                Err(e) => {
                    debug!(pattern = %entry.user, error = %e, "credential pattern is not a valid regex; comparing literally");
                    entry.user == username
                }
            };
            if matched {
                return decrypt(&key, &entry.password).ok();
            }
        }
        None
    }

    pub async fn insert(&self, parsed: &ParsedQuery) -> Result<u64, CredentialError> {
        let _write_guard = self.write_gate.lock().await;
        let mut config = self.get_config().await;
        let key = Self::key_of(&config);
        if config.key.is_none() {
            config.key = Some(STANDARD_NO_PAD.encode(key));
        }
        let rows = columns_to_entries(parsed, &key)?;
        let mut inserted = 0u64;
        for entry in rows {
            if config.servers.iter().any(|e| e.user == entry.user) {
                return Err(CredentialError::AlreadyExists(entry.user));
            }
            config.servers.push(entry);
            inserted += 1;
        }
        self.put_config(config).await?;
        Ok(inserted)
    }

    pub async fn update(&self, parsed: &ParsedQuery) -> Result<u64, CredentialError> {
        let _write_guard = self.write_gate.lock().await;
        let mut config = self.get_config().await;
        let key = Self::key_of(&config);
        let selected = select_indices(parsed, &config.servers, &key)?;
        if selected.is_empty() {
            return Err(CredentialError::NoUpdateData);
        }
        for idx in &selected {
            config.servers[*idx] = apply_update(parsed, &config.servers[*idx], &key)?;
        }
        let updated = selected.len() as u64;
        self.put_config(config).await?;
        Ok(updated)
    }

    pub async fn delete(&self, parsed: &ParsedQuery) -> Result<u64, CredentialError> {
        let _write_guard = self.write_gate.lock().await;
        let mut config = self.get_config().await;
        let key = Self::key_of(&config);
        let selected = select_indices(parsed, &config.servers, &key)?;
        if selected.is_empty() {
            return Err(CredentialError::NotFoundData);
        }
        let removed = selected.len() as u64;
        let selected: HashSet<usize> = selected.into_iter().collect();
        config.servers = config
            .servers
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !selected.contains(i))
            .map(|(_, e)| e)
            .collect();
        self.put_config(config).await?;
        Ok(removed)
    }

    pub async fn select(
        &self,
        parsed: &ParsedQuery,
    ) -> Result<(Vec<String>, Vec<Vec<String>>), CredentialError> {
        let config = self.get_config().await;
        let key = Self::key_of(&config);
        let indices = select_indices(parsed, &config.servers, &key)?;
        let columns = result_columns(parsed);
        let mut rows = Vec::with_capacity(indices.len());
        for idx in indices {
            let entry = &config.servers[idx];
            let plain = decrypt(&key, &entry.password).unwrap_or_default();
            rows.push(project_row(&columns, entry, &plain));
        }
        Ok((columns, rows))
    }
}

fn read_config(path: &Path) -> Option<Config> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(config) => Some(config),
        Err(e) => {
            debug!(error = %e, "credential store json invalid; treating as corrupt");
            None
        }
    }
}

fn write_config(path: &Path, config: &Config) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    {
        let file = std::fs::File::create(&tmp_path)?;
        serde_json::to_writer(file, config)?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl ParsedQuery {
    fn where_op_is_eq(&self) -> bool {
        matches!(self.where_op, Some(ref op) if op == "=")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::parse;

    #[tokio::test]
    async fn bootstraps_admin_entry_when_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        assert_eq!(store.lookup("admin").await, Some("pass".to_string()));
    }

    #[tokio::test]
    async fn insert_then_select_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));

        let insert = parse("INSERT INTO servers(User,Password) VALUES ('u1@h1:3306','s3cret')").unwrap();
        assert_eq!(store.insert(&insert).await.unwrap(), 1);

        let select = parse("SELECT * FROM servers WHERE User='u1@h1:3306'").unwrap();
        let (columns, rows) = store.select(&select).await.unwrap();
        assert_eq!(columns, vec!["User".to_string(), "Password".to_string()]);
        assert_eq!(rows, vec![vec!["u1@h1:3306".to_string(), "s3cret".to_string()]]);

        assert_eq!(store.lookup("u1@h1:3306").await, Some("s3cret".to_string()));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        let insert = parse("INSERT INTO servers(User,Password) VALUES ('dup','x')").unwrap();
        store.insert(&insert).await.unwrap();
        let err = store.insert(&insert).await.unwrap_err();
        assert!(matches!(err, CredentialError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_removes_exactly_selected_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        for user in ["a", "b", "c"] {
            let insert = parse(&format!("INSERT INTO servers(User,Password) VALUES ('{user}','p')")).unwrap();
            store.insert(&insert).await.unwrap();
        }
        let delete = parse("DELETE FROM servers WHERE User='b'").unwrap();
        assert_eq!(store.delete(&delete).await.unwrap(), 1);
        let select = parse("SELECT * FROM servers").unwrap();
        let (_, rows) = store.select(&select).await.unwrap();
        // bootstrap admin + a + c survive
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn update_preserves_row_count_and_changes_only_set_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        let insert = parse("INSERT INTO servers(User,Password) VALUES ('u1','p1')").unwrap();
        store.insert(&insert).await.unwrap();

        let update = parse("UPDATE servers SET Password='p2' WHERE User='u1'").unwrap();
        assert_eq!(store.update(&update).await.unwrap(), 1);
        assert_eq!(store.lookup("u1").await, Some("p2".to_string()));

        let select = parse("SELECT * FROM servers").unwrap();
        let (_, rows) = store.select(&select).await.unwrap();
        assert_eq!(rows.len(), 2); // admin + u1, row count unchanged
    }

    #[tokio::test]
    async fn bad_where_operator_is_rejected_and_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        let before = store.select(&parse("SELECT * FROM servers").unwrap()).await.unwrap();

        let delete = parse("DELETE FROM servers WHERE User < 'z'").unwrap();
        assert!(matches!(delete.statement, Statement::Delete));
        let err = store.delete(&delete).await.unwrap_err();
        assert!(matches!(err, CredentialError::WhereNotEqual));

        let after = store.select(&parse("SELECT * FROM servers").unwrap()).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn regex_user_pattern_matches_subset() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("config.json"));
        let mut config = store.get_config().await;
        let key = CredentialStore::key_of(&config);
        config.servers.push(Entry {
            user: "u.*@example".to_string(),
            password: encrypt(&key, b"s3cret"),
        });
        store.put_config(config).await.unwrap();

        assert_eq!(store.lookup("u1@example").await, Some("s3cret".to_string()));
        assert_eq!(store.lookup("u2@example").await, Some("s3cret".to_string()));
        assert_eq!(store.lookup("u1@other").await, None);
    }

    #[test]
    fn key_change_invalidates_decryption() {
        let key_a = gen_key();
        let key_b = gen_key();
        let encoded = encrypt(&key_a, b"secret");
        assert!(decrypt(&key_b, &encoded).is_err());
        assert_eq!(decrypt(&key_a, &encoded).unwrap(), "secret");
    }
}

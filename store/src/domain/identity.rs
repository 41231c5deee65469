//! Account links between external ids and in-game display names, plus the
//! hidden-name set and the black/white lists.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dual::StoreAdapter;
use crate::engine::{timestamp_column, StorageEngine};
use crate::time::{format_timestamp, TimestampCodec};
use crate::PersistenceError;

/// One external account linked to a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub external_id: String,
    pub display_name: String,
    pub registered_at: NaiveDateTime,
    pub gender: Option<String>,
    /// Kept for history after the owner unlinked; no longer claims the name.
    pub unlinked: bool,
    /// Name at first registration, when it differs from the current one.
    pub original_name: Option<String>,
}

impl Identity {
    pub fn is_active(&self) -> bool {
        !self.unlinked
    }
}

/// All identity state.
///
/// Invariant: at most one active identity per display name, compared
/// case-insensitively. [`link`](Self::link) enforces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityRegistry {
    links: BTreeMap<String, Identity>,
    hidden: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    whitelist: BTreeSet<String>,
}

impl IdentityRegistry {
    /// Link `external_id` to `display_name`.
    ///
    /// Relinking an unlinked record reactivates it under the new name.
    /// Fails with [`PersistenceError::NameTaken`] if another active identity
    /// holds the name.
    pub fn link(
        &mut self,
        external_id: &str,
        display_name: &str,
        at: NaiveDateTime,
    ) -> Result<&Identity, PersistenceError> {
        if let Some(holder) = self.find_by_name(display_name) {
            if holder.external_id != external_id {
                return Err(PersistenceError::NameTaken(display_name.to_string()));
            }
        }

        let identity = self
            .links
            .entry(external_id.to_string())
            .and_modify(|existing| {
                if !existing.display_name.eq_ignore_ascii_case(display_name)
                    && existing.original_name.is_none()
                {
                    existing.original_name = Some(existing.display_name.clone());
                }
                existing.display_name = display_name.to_string();
                existing.unlinked = false;
            })
            .or_insert_with(|| Identity {
                external_id: external_id.to_string(),
                display_name: display_name.to_string(),
                registered_at: at,
                gender: None,
                unlinked: false,
                original_name: None,
            });
        Ok(&*identity)
    }

    /// Mark the identity unlinked. Returns false if it was unknown or already
    /// unlinked.
    pub fn unlink(&mut self, external_id: &str) -> bool {
        match self.links.get_mut(external_id) {
            Some(identity) if !identity.unlinked => {
                identity.unlinked = true;
                true
            }
            _ => false,
        }
    }

    /// Forget the identity entirely.
    pub fn unregister(&mut self, external_id: &str) -> Option<Identity> {
        self.links.remove(external_id)
    }

    pub fn set_gender(&mut self, external_id: &str, gender: Option<String>) -> bool {
        match self.links.get_mut(external_id) {
            Some(identity) => {
                identity.gender = gender;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&Identity> {
        self.links.get(external_id)
    }

    /// The active identity holding `display_name`, ignoring case.
    pub fn find_by_name(&self, display_name: &str) -> Option<&Identity> {
        self.links
            .values()
            .find(|i| i.is_active() && i.display_name.eq_ignore_ascii_case(display_name))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn set_hidden(&mut self, display_name: &str, hidden: bool) {
        let key = display_name.to_lowercase();
        if hidden {
            self.hidden.insert(key);
        } else {
            self.hidden.remove(&key);
        }
    }

    pub fn is_hidden(&self, display_name: &str) -> bool {
        self.hidden.contains(&display_name.to_lowercase())
    }

    pub fn set_blacklisted(&mut self, external_id: &str, listed: bool) {
        toggle(&mut self.blacklist, external_id, listed);
    }

    pub fn is_blacklisted(&self, external_id: &str) -> bool {
        self.blacklist.contains(external_id)
    }

    pub fn set_whitelisted(&mut self, external_id: &str, listed: bool) {
        toggle(&mut self.whitelist, external_id, listed);
    }

    pub fn is_whitelisted(&self, external_id: &str) -> bool {
        self.whitelist.contains(external_id)
    }

    /// Insert a record as found in storage. A second active holder of a name
    /// is demoted to unlinked rather than rejected, so corrupt input still
    /// loads.
    fn restore(&mut self, mut identity: Identity) {
        if identity.is_active() {
            if let Some(holder) = self.find_by_name(&identity.display_name) {
                warn!(
                    external_id = %identity.external_id,
                    holder = %holder.external_id,
                    name = %identity.display_name,
                    "Duplicate active display name, keeping record as unlinked"
                );
                identity.unlinked = true;
            }
        }
        self.links.insert(identity.external_id.clone(), identity);
    }
}

fn toggle(set: &mut BTreeSet<String>, id: &str, present: bool) {
    if present {
        set.insert(id.to_string());
    } else {
        set.remove(id);
    }
}

// ── Flat-file document ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityDocument {
    #[serde(default)]
    pub links: BTreeMap<String, IdentityRecord>,
    #[serde(default)]
    pub hidden: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityRecord {
    pub name: String,
    pub registered: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub unlinked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

// ── Adapter ─────────────────────────────────────────────────────────────

/// [`StoreAdapter`] for [`IdentityRegistry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdapter;

const SELECT_IDENTITIES: &str = "SELECT external_id, display_name, registered_at, gender, \
     unlinked, original_name FROM identities ORDER BY external_id";

const INSERT_IDENTITY: &str = "INSERT INTO identities \
     (external_id, display_name, registered_at, gender, unlinked, original_name) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

impl IdentityAdapter {
    /// Unlinked rows first so a relinked name never trips the unique index.
    fn unlinked_first(state: &IdentityRegistry) -> impl Iterator<Item = &Identity> {
        state
            .identities()
            .filter(|i| i.unlinked)
            .chain(state.identities().filter(|i| !i.unlinked))
    }

    fn insert_identity(
        insert: &mut rusqlite::Statement<'_>,
        i: &Identity,
        unlinked: bool,
    ) -> rusqlite::Result<usize> {
        insert.execute(params![
            i.external_id,
            i.display_name,
            format_timestamp(&i.registered_at),
            i.gender,
            unlinked,
            i.original_name,
        ])
    }

    fn insert_sets(conn: &Connection, state: &IdentityRegistry) -> rusqlite::Result<usize> {
        let sets = [
            ("hidden_names", "display_name", &state.hidden),
            ("blacklist", "external_id", &state.blacklist),
            ("whitelist", "external_id", &state.whitelist),
        ];
        let mut written = 0;
        for (table, column, members) in sets {
            let mut insert =
                conn.prepare(&format!("INSERT OR IGNORE INTO {table} ({column}) VALUES (?1)"))?;
            for member in members {
                written += insert.execute([member])?;
            }
        }
        Ok(written)
    }
}

impl StoreAdapter for IdentityAdapter {
    type State = IdentityRegistry;
    type Document = IdentityDocument;

    const NAME: &'static str = "identities";
    const FILE_NAME: &'static str = "identities.json";

    fn load_relational(&self, engine: &StorageEngine) -> Option<IdentityRegistry> {
        let identities = engine.query_rows(SELECT_IDENTITIES, &[], |row| {
            Ok(Identity {
                external_id: row.get(0)?,
                display_name: row.get(1)?,
                registered_at: timestamp_column(row, 2)?,
                gender: row.get(3)?,
                unlinked: row.get(4)?,
                original_name: row.get(5)?,
            })
        })?;
        let set = |sql: &str| -> Option<BTreeSet<String>> {
            engine
                .query_rows(sql, &[], |row| row.get::<_, String>(0))
                .map(|v| v.into_iter().collect())
        };

        let mut registry = IdentityRegistry {
            hidden: set("SELECT lower(display_name) FROM hidden_names")?,
            blacklist: set("SELECT external_id FROM blacklist")?,
            whitelist: set("SELECT external_id FROM whitelist")?,
            ..IdentityRegistry::default()
        };
        for identity in identities {
            registry.restore(identity);
        }
        Some(registry)
    }

    fn write_relational(
        &self,
        conn: &Connection,
        state: &IdentityRegistry,
    ) -> Result<(), PersistenceError> {
        conn.execute_batch(
            "DELETE FROM identities; DELETE FROM hidden_names; \
             DELETE FROM blacklist; DELETE FROM whitelist;",
        )?;
        let mut insert = conn.prepare(INSERT_IDENTITY)?;
        for i in Self::unlinked_first(state) {
            Self::insert_identity(&mut insert, i, i.unlinked)?;
        }
        Self::insert_sets(conn, state)?;
        Ok(())
    }

    fn merge_relational(
        &self,
        conn: &Connection,
        state: &IdentityRegistry,
    ) -> Result<usize, PersistenceError> {
        // Stored accounts win: known ids are skipped, and a name held by
        // another active account comes in unlinked.
        let mut known = conn.prepare("SELECT 1 FROM identities WHERE external_id = ?1")?;
        let mut holder = conn.prepare(
            "SELECT external_id FROM identities \
             WHERE display_name = ?1 COLLATE NOCASE AND unlinked = 0 LIMIT 1",
        )?;
        let mut insert = conn.prepare(INSERT_IDENTITY)?;
        let mut written = 0;
        for i in Self::unlinked_first(state) {
            if known.exists([&i.external_id])? {
                continue;
            }
            let mut unlinked = i.unlinked;
            if !unlinked {
                if let Some(active) = holder
                    .query_row([&i.display_name], |row| row.get::<_, String>(0))
                    .optional()?
                {
                    warn!(
                        external_id = %i.external_id,
                        holder = %active,
                        name = %i.display_name,
                        "Display name already active, importing record as unlinked"
                    );
                    unlinked = true;
                }
            }
            written += Self::insert_identity(&mut insert, i, unlinked)?;
        }
        Ok(written + Self::insert_sets(conn, state)?)
    }

    fn decode(&self, doc: IdentityDocument, timestamps: &TimestampCodec) -> IdentityRegistry {
        let mut registry = IdentityRegistry::default();
        for (external_id, record) in doc.links {
            let context = format!("identity {external_id}");
            let Some(registered_at) = timestamps.decode(&record.registered, &context) else {
                continue;
            };
            registry.restore(Identity {
                external_id,
                display_name: record.name,
                registered_at,
                gender: record.gender,
                unlinked: record.unlinked,
                original_name: record.original_name,
            });
        }
        for name in doc.hidden {
            registry.set_hidden(&name, true);
        }
        registry.blacklist.extend(doc.blacklist);
        registry.whitelist.extend(doc.whitelist);
        registry
    }

    fn encode(&self, state: &IdentityRegistry) -> IdentityDocument {
        IdentityDocument {
            links: state
                .links
                .iter()
                .map(|(id, i)| {
                    let record = IdentityRecord {
                        name: i.display_name.clone(),
                        registered: format_timestamp(&i.registered_at),
                        gender: i.gender.clone(),
                        unlinked: i.unlinked,
                        original_name: i.original_name.clone(),
                    };
                    (id.clone(), record)
                })
                .collect(),
            hidden: state.hidden.iter().cloned().collect(),
            blacklist: state.blacklist.iter().cloned().collect(),
            whitelist: state.whitelist.iter().cloned().collect(),
        }
    }
}

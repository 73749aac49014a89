//! Metadata store collaborator: the [`Database`] trait the orchestrator
//! consumes, and [`MemoryDatabase`], an implementation persisted as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::{
    ImageRecord, Session, SessionKey, keys, normalize_imagetyp, normalize_token,
};

pub type ImageId = u64;
pub type SessionId = u64;

/// Conjunction of image predicates. Field values compare normalised.
#[derive(Debug, Clone, Default)]
pub struct ImageQuery {
    pub repo_urls: Option<Vec<String>>,
    pub equals: Vec<(String, String)>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ImageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images of `session`: same repo and key, inside its window.
    pub fn for_session(session: &Session) -> Self {
        Self::new()
            .in_repos(vec![session.reference.repo_url.clone()])
            .field(keys::FILTER, &session.key.filter)
            .field(keys::IMAGETYP, &session.key.imagetyp)
            .field(keys::OBJECT, &session.key.object)
            .field(keys::TELESCOP, &session.key.telescop)
            .between(session.start, session.end)
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.equals.push((key.to_string(), value.to_string()));
        self
    }

    pub fn in_repos(mut self, urls: Vec<String>) -> Self {
        self.repo_urls = Some(urls);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, image: &ImageRecord) -> bool {
        if let Some(urls) = &self.repo_urls
            && !urls.iter().any(|url| url == &image.repo_url)
        {
            return false;
        }
        for (key, expected) in &self.equals {
            let actual = image.metadata.get(key).map(String::as_str).unwrap_or("");
            if normalize_field(key, actual) != normalize_field(key, expected) {
                return false;
            }
        }
        if self.from.is_some() || self.to.is_some() {
            let Some(at) = image.timestamp() else {
                return false;
            };
            if self.from.is_some_and(|from| at < from) || self.to.is_some_and(|to| at > to) {
                return false;
            }
        }
        true
    }
}

fn normalize_field(key: &str, value: &str) -> String {
    if key == keys::IMAGETYP {
        normalize_imagetyp(value)
    } else {
        normalize_token(value)
    }
}

/// Session filter used for selections. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub telescopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imagetyp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl SessionQuery {
    pub fn is_empty(&self) -> bool {
        self == &SessionQuery::default()
    }

    pub fn matches(&self, session: &Session) -> bool {
        let listed = |list: &[String], value: &str| {
            list.is_empty()
                || list
                    .iter()
                    .any(|item| normalize_token(item) == normalize_token(value))
        };
        listed(&self.targets, &session.key.object)
            && listed(&self.filters, &session.key.filter)
            && listed(&self.telescopes, &session.key.telescop)
            && self
                .imagetyp
                .as_deref()
                .is_none_or(|kind| normalize_imagetyp(kind) == session.key.imagetyp)
            && self.from.is_none_or(|from| session.end >= from)
            && self.to.is_none_or(|to| session.start <= to)
    }
}

pub trait Database {
    fn upsert_image(&mut self, record: ImageRecord, repo_url: &str) -> Result<ImageId>;
    fn get_image(&self, repo_url: &str, path: &Path) -> Result<Option<ImageRecord>>;
    fn search_image(&self, query: &ImageQuery) -> Result<Vec<ImageRecord>>;
    fn upsert_session(&mut self, session: Session, existing: Option<SessionId>)
    -> Result<SessionId>;
    fn search_session(&self, query: Option<&SessionQuery>) -> Result<Vec<Session>>;
    /// Session sharing `key` whose window (widened by the session window)
    /// contains `at`.
    fn get_session(&self, key: &SessionKey, at: DateTime<Utc>) -> Result<Option<Session>>;
    /// [`Database::get_session`] limited to sessions opened from images of
    /// `repo_url`.
    fn get_repo_session(
        &self,
        repo_url: &str,
        key: &SessionKey,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>>;
    /// Deletes the repo's images and the sessions derived from them.
    fn remove_repo(&mut self, url: &str) -> Result<()>;
}

/// Records `record` and merges it into a session of the same repo, opening a
/// new session when no existing window accepts it. Re-adding a known image only
/// refreshes its metadata.
pub fn add_image(db: &mut dyn Database, record: ImageRecord) -> Result<ImageId> {
    let repo_url = record.repo_url.clone();
    let known = db.get_image(&repo_url, &record.path)?.is_some();
    let id = db.upsert_image(record.clone(), &repo_url)?;
    if known {
        return Ok(id);
    }
    let Some(at) = record.timestamp() else {
        warn!(image = %record.path.display(), "Image has no timestamp; not assigned to a session");
        return Ok(id);
    };
    match db.get_repo_session(&repo_url, &record.session_key(), at)? {
        Some(mut session) => {
            let existing = session.id;
            session.absorb(&record);
            db.upsert_session(session, existing)?;
        }
        None => {
            db.upsert_session(Session::from_image(&record)?, None)?;
        }
    }
    Ok(id)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    images: Vec<ImageRecord>,
    sessions: Vec<Session>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    store: Store,
    path: Option<PathBuf>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the JSON file at `path`; a missing file starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let store = if path.is_file() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read database: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse database: {}", path.display()))?
        } else {
            Store::default()
        };
        Ok(Self {
            store,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create database: {}", path.display()))?;
        serde_json::to_writer_pretty(file, &self.store)
            .with_context(|| format!("Failed to write database: {}", path.display()))?;
        debug!(database = %path.display(), "Database saved");
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.store.images.len()
    }

    fn next_id(&mut self) -> u64 {
        self.store.next_id += 1;
        self.store.next_id
    }
}

impl Database for MemoryDatabase {
    fn upsert_image(&mut self, mut record: ImageRecord, repo_url: &str) -> Result<ImageId> {
        record.repo_url = repo_url.to_string();
        if let Some(existing) = self
            .store
            .images
            .iter_mut()
            .find(|image| image.repo_url == record.repo_url && image.path == record.path)
        {
            record.id = existing.id;
            *existing = record;
            return Ok(existing.id.unwrap_or_default());
        }
        let id = self.next_id();
        record.id = Some(id);
        self.store.images.push(record);
        Ok(id)
    }

    fn get_image(&self, repo_url: &str, path: &Path) -> Result<Option<ImageRecord>> {
        Ok(self
            .store
            .images
            .iter()
            .find(|image| image.repo_url == repo_url && image.path == path)
            .cloned())
    }

    fn search_image(&self, query: &ImageQuery) -> Result<Vec<ImageRecord>> {
        Ok(self
            .store
            .images
            .iter()
            .filter(|image| query.matches(image))
            .cloned()
            .collect())
    }

    fn upsert_session(
        &mut self,
        mut session: Session,
        existing: Option<SessionId>,
    ) -> Result<SessionId> {
        if let Some(id) = existing
            && let Some(slot) = self.store.sessions.iter_mut().find(|s| s.id == Some(id))
        {
            session.id = Some(id);
            *slot = session;
            return Ok(id);
        }
        let id = self.next_id();
        session.id = Some(id);
        self.store.sessions.push(session);
        Ok(id)
    }

    fn search_session(&self, query: Option<&SessionQuery>) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .store
            .sessions
            .iter()
            .filter(|session| query.is_none_or(|q| q.matches(session)))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn get_session(&self, key: &SessionKey, at: DateTime<Utc>) -> Result<Option<Session>> {
        Ok(self
            .store
            .sessions
            .iter()
            .find(|session| &session.key == key && session.accepts(at))
            .cloned())
    }

    fn get_repo_session(
        &self,
        repo_url: &str,
        key: &SessionKey,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        Ok(self
            .store
            .sessions
            .iter()
            .find(|session| {
                session.reference.repo_url == repo_url && &session.key == key && session.accepts(at)
            })
            .cloned())
    }

    fn remove_repo(&mut self, url: &str) -> Result<()> {
        let images_before = self.store.images.len();
        self.store.images.retain(|image| image.repo_url != url);
        let sessions_before = self.store.sessions.len();
        self.store
            .sessions
            .retain(|session| session.reference.repo_url != url);
        debug!(
            repo = url,
            images = images_before - self.store.images.len(),
            sessions = sessions_before - self.store.sessions.len(),
            "Removed repo from database"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn light(name: &str, date: &str, filter: &str) -> ImageRecord {
        ImageRecord::new(
            "file:///raw",
            format!("{name}.fits"),
            BTreeMap::from([
                (keys::FILTER.to_string(), filter.to_string()),
                (keys::IMAGETYP.to_string(), "LIGHT".to_string()),
                (keys::OBJECT.to_string(), "NGC 7000".to_string()),
                (keys::TELESCOP.to_string(), "Redcat".to_string()),
                (keys::DATE_OBS.to_string(), date.to_string()),
                (keys::EXPTIME.to_string(), "300".to_string()),
            ]),
        )
    }

    #[test]
    fn images_within_window_share_a_session() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("b", "2025-06-02T04:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("c", "2025-06-03T22:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("d", "2025-06-01T23:00:00", "SiiOiii")).unwrap();

        let sessions = db.search_session(None).unwrap();
        assert_eq!(sessions.len(), 3);
        let first = &sessions[0];
        assert_eq!(first.num_images, 2);
        assert_eq!(first.exptime_total, 600.0);
        assert_eq!(first.end.format("%H").to_string(), "04");
    }

    #[test]
    fn re_adding_an_image_does_not_double_count() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        assert_eq!(db.image_count(), 1);
        assert_eq!(db.search_session(None).unwrap()[0].num_images, 1);
    }

    #[test]
    fn session_images_are_found_by_query() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("b", "2025-06-01T23:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("c", "2025-06-01T23:00:00", "SiiOiii")).unwrap();
        let session = db.search_session(None).unwrap().remove(0);
        let images = db.search_image(&ImageQuery::for_session(&session)).unwrap();
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn remove_repo_cascades() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        db.remove_repo("file:///raw").unwrap();
        assert_eq!(db.image_count(), 0);
        assert!(db.search_session(None).unwrap().is_empty());
    }

    #[test]
    fn sessions_do_not_span_repos() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        let mut master = light("master", "2025-06-01T22:30:00", "HaOiii");
        master.repo_url = "file:///masters".to_string();
        add_image(&mut db, master).unwrap();

        let sessions = db.search_session(None).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.num_images == 1));
        let raw = sessions
            .iter()
            .find(|s| s.reference.repo_url == "file:///raw")
            .unwrap();
        assert_eq!(db.search_image(&ImageQuery::for_session(raw)).unwrap().len(), 1);

        db.remove_repo("file:///masters").unwrap();
        let sessions = db.search_session(None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].num_images, 1);
    }

    #[test]
    fn persists_to_json() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db").join("index.json");
        let mut db = MemoryDatabase::open(&path).unwrap();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        db.save().unwrap();

        let reopened = MemoryDatabase::open(&path).unwrap();
        assert_eq!(reopened.image_count(), 1);
        assert_eq!(reopened.search_session(None).unwrap().len(), 1);
    }

    #[test]
    fn session_query_filters_by_target_and_filter() {
        let mut db = MemoryDatabase::new();
        add_image(&mut db, light("a", "2025-06-01T22:00:00", "HaOiii")).unwrap();
        add_image(&mut db, light("b", "2025-06-01T22:00:00", "SiiOiii")).unwrap();
        let query = SessionQuery {
            targets: vec!["ngc7000".into()],
            filters: vec!["Ha-OIII".into()],
            ..Default::default()
        };
        let sessions = db.search_session(Some(&query)).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].key.filter, "haoiii");
    }
}

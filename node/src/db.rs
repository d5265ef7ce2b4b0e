use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension as _};

use crate::error::{Error, Result};

const CREATE_USERS: &str = "CREATE TABLE IF NOT EXISTS users
    (id INTEGER PRIMARY KEY, username TEXT UNIQUE, password_hash TEXT,
     private_key_ciphertext TEXT, private_key_iv TEXT, private_key_salt TEXT,
     wallet_address TEXT)";

const CREATE_UPLOADS: &str = "CREATE TABLE IF NOT EXISTS uploads
    (id INTEGER PRIMARY KEY, peer_id TEXT, cid TEXT, filename TEXT,
     price FLOAT, size INTEGER, timestamp TEXT, UNIQUE(peer_id, cid))";

const CREATE_DOWNLOADS: &str = "CREATE TABLE IF NOT EXISTS downloads
    (id INTEGER PRIMARY KEY, peer_id TEXT, provider_id TEXT, cid TEXT,
     filename TEXT, price FLOAT, size INTEGER, timestamp TEXT)";

/// A stored user row. Binary columns are hex-encoded in the database.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub password_hash: Vec<u8>,
    pub key_ciphertext: Vec<u8>,
    pub key_iv: Vec<u8>,
    pub key_salt: Vec<u8>,
    pub wallet_address: String,
}

/// A file this peer offers, as persisted.
#[derive(Clone, Debug, serde::Serialize)]
pub struct UploadRecord {
    pub peer_id: String,
    pub cid: String,
    pub filename: String,
    pub price: f64,
    pub size: u64,
    pub timestamp: String,
}

/// A completed download, as persisted. The same file may be downloaded more
/// than once, so there is no uniqueness constraint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct DownloadRecord {
    pub peer_id: String,
    pub provider_id: String,
    pub cid: String,
    pub filename: String,
    pub price: f64,
    pub size: u64,
    pub timestamp: String,
}

/// The embedded database holding users, uploads and downloads. Upload and
/// download writes are independent single-row operations.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and its tables.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(CREATE_USERS, [])?;
        conn.execute(CREATE_UPLOADS, [])?;
        conn.execute(CREATE_DOWNLOADS, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }

    pub fn add_user(&self, username: &str, record: &UserRecord) -> Result<()> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO users
             (username, password_hash, private_key_ciphertext, private_key_iv,
              private_key_salt, wallet_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                username,
                hex::encode(&record.password_hash),
                hex::encode(&record.key_ciphertext),
                hex::encode(&record.key_iv),
                hex::encode(&record.key_salt),
                record.wallet_address,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::UsernameTaken);
        }
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT password_hash, private_key_ciphertext, private_key_iv,
                        private_key_salt, wallet_address
                 FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((hash, ciphertext, iv, salt, wallet_address)) = row else {
            return Ok(None);
        };
        let decode = |s: &str| hex::decode(s).map_err(|_| Error::Internal);
        Ok(Some(UserRecord {
            password_hash: decode(&hash)?,
            key_ciphertext: decode(&ciphertext)?,
            key_iv: decode(&iv)?,
            key_salt: decode(&salt)?,
            wallet_address,
        }))
    }

    pub fn set_wallet_address(&self, username: &str, wallet_address: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET wallet_address = ?1 WHERE username = ?2",
            params![wallet_address, username],
        )?;
        Ok(())
    }

    /// Insert an upload row, or refresh filename/price/size in place when the
    /// same `(peer_id, cid)` pair is published again.
    pub fn add_upload(&self, record: &UploadRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO uploads (peer_id, cid, filename, price, size, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(peer_id, cid)
             DO UPDATE SET filename = ?3, price = ?4, size = ?5",
            params![
                record.peer_id,
                record.cid,
                record.filename,
                record.price,
                record.size as i64,
                record.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn get_uploads(&self, peer_id: &str) -> Result<Vec<UploadRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT cid, filename, price, size, timestamp FROM uploads WHERE peer_id = ?1",
        )?;
        let rows = stmt.query_map(params![peer_id], |row| {
            Ok(UploadRecord {
                peer_id: peer_id.to_owned(),
                cid: row.get(0)?,
                filename: row.get(1)?,
                price: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
                timestamp: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn remove_upload(&self, peer_id: &str, cid: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM uploads WHERE peer_id = ?1 AND cid = ?2",
            params![peer_id, cid],
        )?;
        Ok(())
    }

    pub fn add_download(&self, record: &DownloadRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO downloads
             (peer_id, provider_id, cid, filename, price, size, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.peer_id,
                record.provider_id,
                record.cid,
                record.filename,
                record.price,
                record.size as i64,
                record.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn get_downloads(&self, peer_id: &str) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT provider_id, cid, filename, price, size, timestamp
             FROM downloads WHERE peer_id = ?1",
        )?;
        let rows = stmt.query_map(params![peer_id], |row| {
            Ok(DownloadRecord {
                peer_id: peer_id.to_owned(),
                provider_id: row.get(0)?,
                cid: row.get(1)?,
                filename: row.get(2)?,
                price: row.get(3)?,
                size: row.get::<_, i64>(4)? as u64,
                timestamp: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Database::open(&dir.path().join("node.db")).expect("open database");
        (dir, db)
    }

    fn user() -> UserRecord {
        UserRecord {
            password_hash: vec![1, 2, 3],
            key_ciphertext: vec![4; 80],
            key_iv: vec![5; 16],
            key_salt: vec![6; 16],
            wallet_address: String::new(),
        }
    }

    #[test]
    fn user_round_trip_and_uniqueness() {
        let (_dir, db) = open_temp();
        db.add_user("alice", &user()).expect("first insert");
        assert_eq!(db.add_user("alice", &user()), Err(Error::UsernameTaken));

        let stored = db.get_user("alice").expect("query").expect("row exists");
        assert_eq!(stored.password_hash, vec![1, 2, 3]);
        assert_eq!(stored.key_iv, vec![5; 16]);
        assert!(db.get_user("bob").expect("query").is_none());
    }

    #[test]
    fn wallet_address_updates_in_place() {
        let (_dir, db) = open_temp();
        db.add_user("alice", &user()).expect("insert");
        db.set_wallet_address("alice", "bc1qexample")
            .expect("update");
        let stored = db.get_user("alice").expect("query").expect("row exists");
        assert_eq!(stored.wallet_address, "bc1qexample");
    }

    #[test]
    fn upload_upsert_is_unique_per_peer_and_cid() {
        let (_dir, db) = open_temp();
        let mut record = UploadRecord {
            peer_id: "peer".to_owned(),
            cid: "bafkreiexample".to_owned(),
            filename: "a.txt".to_owned(),
            price: 0.5,
            size: 10,
            timestamp: "2024-01-01T00:00:00Z".to_owned(),
        };
        db.add_upload(&record).expect("insert");

        // Re-publishing the same content refreshes metadata in place.
        record.filename = "b.txt".to_owned();
        record.price = 1.5;
        db.add_upload(&record).expect("upsert");

        let uploads = db.get_uploads("peer").expect("query");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].filename, "b.txt");
        assert_eq!(uploads[0].price, 1.5);

        db.remove_upload("peer", "bafkreiexample").expect("delete");
        assert!(db.get_uploads("peer").expect("query").is_empty());
    }

    #[test]
    fn downloads_allow_duplicates() {
        let (_dir, db) = open_temp();
        let record = DownloadRecord {
            peer_id: "peer".to_owned(),
            provider_id: "provider".to_owned(),
            cid: "bafkreiexample".to_owned(),
            filename: "a.txt".to_owned(),
            price: 0.5,
            size: 10,
            timestamp: "2024-01-01T00:00:00Z".to_owned(),
        };
        db.add_download(&record).expect("first insert");
        db.add_download(&record).expect("second insert");
        assert_eq!(db.get_downloads("peer").expect("query").len(), 2);
    }
}

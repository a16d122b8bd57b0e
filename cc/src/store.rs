//! SQLite-backed context card store

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::debug;

use crate::card::ContextCard;
use crate::embed::cosine_similarity;

#[derive(Debug, Error)]
pub enum CardStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stores generated context cards keyed by `(session_id, content_hash)`
pub struct CardStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS context_cards (
    session_id       TEXT NOT NULL,
    content_hash     TEXT NOT NULL,
    role             TEXT NOT NULL,
    summary          TEXT NOT NULL,
    keywords         TEXT NOT NULL,
    embedding        TEXT,
    estimated_tokens INTEGER NOT NULL,
    phase_name       TEXT,
    cascade_id       TEXT,
    turn_number      INTEGER,
    is_callout       INTEGER NOT NULL DEFAULT 0,
    callout_name     TEXT,
    created_at       TEXT NOT NULL,
    PRIMARY KEY (session_id, content_hash)
);
CREATE INDEX IF NOT EXISTS idx_cards_session ON context_cards(session_id);
";

impl CardStore {
    /// Open or create a card store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CardStoreError> {
        debug!(path = %path.as_ref().display(), "CardStore::open: called");
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> Result<Self, CardStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert a batch of cards. Re-inserting the same key overwrites.
    pub fn insert_cards(&self, cards: &[ContextCard]) -> Result<(), CardStoreError> {
        debug!(count = cards.len(), "CardStore::insert_cards");
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        for card in cards {
            conn.execute(
                "INSERT OR REPLACE INTO context_cards
                 (session_id, content_hash, role, summary, keywords, embedding, estimated_tokens,
                  phase_name, cascade_id, turn_number, is_callout, callout_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    card.session_id,
                    card.content_hash,
                    card.role,
                    card.summary,
                    serde_json::to_string(&card.keywords)?,
                    card.embedding.as_ref().map(serde_json::to_string).transpose()?,
                    card.estimated_tokens as i64,
                    card.phase_name,
                    card.cascade_id,
                    card.turn_number,
                    card.is_callout as i64,
                    card.callout_name,
                    card.created_at.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    /// All cards for a session, oldest first
    pub fn cards_for_session(&self, session_id: &str) -> Result<Vec<ContextCard>, CardStoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT session_id, content_hash, role, summary, keywords, embedding, estimated_tokens,
                    phase_name, cascade_id, turn_number, is_callout, callout_name, created_at
             FROM context_cards WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_card)?;
        let mut cards = Vec::new();
        for row in rows {
            cards.push(row?);
        }
        Ok(cards)
    }

    /// Top-k cards in a session ranked by cosine similarity to a query vector
    pub fn similar(
        &self,
        session_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(ContextCard, f32)>, CardStoreError> {
        let mut scored: Vec<(ContextCard, f32)> = self
            .cards_for_session(session_id)?
            .into_iter()
            .filter_map(|card| {
                let score = card.embedding.as_ref().map(|e| cosine_similarity(e, query))?;
                Some((card, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Number of stored cards
    pub fn count(&self) -> Result<usize, CardStoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM context_cards", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn row_to_card(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextCard> {
    let keywords: String = row.get(4)?;
    let embedding: Option<String> = row.get(5)?;
    let created_at: String = row.get(12)?;
    Ok(ContextCard {
        session_id: row.get(0)?,
        content_hash: row.get(1)?,
        role: row.get(2)?,
        summary: row.get(3)?,
        keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        embedding: embedding.and_then(|e| serde_json::from_str(&e).ok()),
        estimated_tokens: row.get::<_, i64>(6)? as usize,
        phase_name: row.get(7)?,
        cascade_id: row.get(8)?,
        turn_number: row.get(9)?,
        is_callout: row.get::<_, i64>(10)? != 0,
        callout_name: row.get(11)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn card(session: &str, hash: &str, summary: &str, embedding: Option<Vec<f32>>) -> ContextCard {
        ContextCard {
            session_id: session.to_string(),
            content_hash: hash.to_string(),
            role: "assistant".to_string(),
            summary: summary.to_string(),
            keywords: vec!["alpha".to_string()],
            embedding,
            estimated_tokens: 4,
            phase_name: None,
            cascade_id: None,
            turn_number: None,
            is_callout: false,
            callout_name: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = CardStore::open_in_memory().unwrap();
        store.insert_cards(&[card("s1", "h1", "first", None)]).unwrap();
        store.insert_cards(&[card("s1", "h2", "second", None)]).unwrap();

        let cards = store.cards_for_session("s1").unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].keywords, vec!["alpha"]);
    }

    #[test]
    fn test_upsert_by_key() {
        let store = CardStore::open_in_memory().unwrap();
        store.insert_cards(&[card("s1", "h1", "v1", None)]).unwrap();
        store.insert_cards(&[card("s1", "h1", "v2", None)]).unwrap();

        let cards = store.cards_for_session("s1").unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].summary, "v2");
    }

    #[test]
    fn test_similar_ranks_by_cosine() {
        let store = CardStore::open_in_memory().unwrap();
        store
            .insert_cards(&[
                card("s1", "h1", "near", Some(vec![1.0, 0.0])),
                card("s1", "h2", "far", Some(vec![0.0, 1.0])),
                card("s1", "h3", "no-embedding", None),
            ])
            .unwrap();

        let hits = store.similar("s1", &[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.summary, "near");
        assert!(hits[0].1 > hits[1].1);
    }
}
